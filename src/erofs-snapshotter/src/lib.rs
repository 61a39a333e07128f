//! An out-of-process containerd snapshotter that materialises image layers
//! as EROFS blobs, composes committed chains into multi-device EROFS views,
//! and converts tar layer streams to EROFS in a single pass.

pub mod blob;
pub mod config;
pub mod differ;
pub mod error;
pub mod fsmeta;
pub mod layer_order;
pub mod metadata;
pub mod mount_state;
pub mod mounts;
pub mod retry;
pub mod rwlayer;
pub mod snapshotter;
pub mod vmdk;
