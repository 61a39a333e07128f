//! Explicit tracking of host-side ext4 block mounts.
//!
//! Querying the kernel mount table is racy against concurrent unmounts and
//! fails outright for paths that no longer exist, so the engine records what
//! it has done itself rather than asking the filesystem. The tracker covers
//! only the ext4 writable-layer mounts created for extract snapshots; EROFS
//! and overlay mounts belong to the runtime.

use std::collections::HashMap;
use std::sync::RwLock;

/// State of one snapshot's ext4 block mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountState {
    /// State has never been set for this snapshot.
    #[default]
    Unknown,
    /// Not mounted on the host: the initial state for new snapshots and the
    /// final state after commit.
    Unmounted,
    /// Mounted on the host, but not by us.
    Mounted,
    /// Mounted by this engine, which is therefore responsible for cleanup.
    MountedByUs,
}

impl MountState {
    pub fn is_mounted(self) -> bool {
        matches!(self, MountState::Mounted | MountState::MountedByUs)
    }

    pub fn needs_cleanup(self) -> bool {
        self == MountState::MountedByUs
    }
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MountState::Unknown => "unknown",
            MountState::Unmounted => "unmounted",
            MountState::Mounted => "mounted",
            MountState::MountedByUs => "mounted-by-us",
        };
        write!(f, "{s}")
    }
}

/// Thread-safe map of snapshot id to mount state.
#[derive(Debug, Default)]
pub struct MountTracker {
    states: RwLock<HashMap<String, MountState>>,
}

impl MountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state, or `Unknown` if the id is untracked.
    pub fn get(&self, id: &str) -> MountState {
        self.states
            .read()
            .expect("mount tracker lock poisoned")
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    /// Updates the state for a snapshot id. Setting `Unmounted` removes the
    /// entry so the map stays bounded by the number of live mounts.
    pub fn set(&self, id: &str, state: MountState) {
        let mut states = self.states.write().expect("mount tracker lock poisoned");
        if state == MountState::Unmounted {
            states.remove(id);
        } else {
            states.insert(id.to_string(), state);
        }
    }

    /// Marks a snapshot as mounted by us (we own the cleanup).
    pub fn set_mounted(&self, id: &str) {
        self.set(id, MountState::MountedByUs);
    }

    /// Marks a snapshot as unmounted and drops it from tracking.
    pub fn set_unmounted(&self, id: &str) {
        self.set(id, MountState::Unmounted);
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.get(id).is_mounted()
    }

    pub fn needs_cleanup(&self, id: &str) -> bool {
        self.get(id).needs_cleanup()
    }

    /// Snapshot of all currently mounted ids, for shutdown cleanup.
    pub fn get_all_mounted(&self) -> Vec<String> {
        self.states
            .read()
            .expect("mount tracker lock poisoned")
            .iter()
            .filter(|(_, state)| state.is_mounted())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Removes all tracked state.
    pub fn clear(&self) {
        self.states
            .write()
            .expect("mount tracker lock poisoned")
            .clear();
    }
}
