// Common EROFS format constants and helpers shared by the snapshotter and
// its tooling.

pub mod constants;
pub mod utils;
