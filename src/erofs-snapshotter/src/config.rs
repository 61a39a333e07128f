//! Daemon configuration: defaults, optional TOML file, CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SnapshotterError};

fn default_rwlayer_size() -> u64 {
    1 << 30
}

fn default_max_unmerged_layers() -> usize {
    8
}

fn default_mkfs_options() -> Vec<String> {
    vec![
        "-T".into(),
        "0".into(),
        "--mkfs-time".into(),
        "--quiet".into(),
    ]
}

fn default_fsmeta_wait_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotterConfig {
    /// State directory: metadata store, snapshot directories, blobs.
    #[serde(default)]
    pub root: PathBuf,

    /// Size of the writable ext4 image allocated per extract snapshot.
    /// Zero selects directory mode (no block image).
    #[serde(default = "default_rwlayer_size")]
    pub rwlayer_size: u64,

    /// When a committed chain grows past this many layers, a background
    /// fsmeta rebuild is scheduled for the new tip. Zero disables it.
    #[serde(default = "default_max_unmerged_layers")]
    pub max_unmerged_layers: usize,

    /// Options passed to every mkfs.erofs invocation.
    #[serde(default = "default_mkfs_options")]
    pub mkfs_options: Vec<String>,

    /// Use tar index mode (`--tar=i`) instead of full conversion.
    #[serde(default)]
    pub tar_index_mode: bool,

    /// How long a waiter polls for another producer's fsmeta.
    #[serde(default = "default_fsmeta_wait_secs")]
    pub fsmeta_wait_secs: u64,

    /// The runtime's own socket; recorded for tooling, unused by the engine.
    #[serde(default)]
    pub containerd_address: Option<String>,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        SnapshotterConfig {
            root: PathBuf::new(),
            rwlayer_size: default_rwlayer_size(),
            max_unmerged_layers: default_max_unmerged_layers(),
            mkfs_options: default_mkfs_options(),
            tar_index_mode: false,
            fsmeta_wait_secs: default_fsmeta_wait_secs(),
            containerd_address: None,
        }
    }
}

impl SnapshotterConfig {
    /// Loads configuration from an optional TOML file; missing file ⇒
    /// defaults. CLI flags are applied on top by the caller.
    pub fn load(path: Option<&Path>) -> Result<SnapshotterConfig> {
        let Some(path) = path else {
            return Ok(SnapshotterConfig::default());
        };
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| {
            SnapshotterError::InvalidState(format!("config file {}: {err}", path.display()))
        })
    }

    pub fn fsmeta_wait(&self) -> Duration {
        Duration::from_secs(self.fsmeta_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = SnapshotterConfig::load(None).unwrap();
        assert_eq!(cfg.rwlayer_size, 1 << 30);
        assert_eq!(cfg.max_unmerged_layers, 8);
        assert!(!cfg.tar_index_mode);
        assert_eq!(cfg.fsmeta_wait(), Duration::from_secs(30));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
root = "/var/lib/erofs"
rwlayer_size = 2048
max_unmerged_layers = 0
tar_index_mode = true
"#,
        )
        .unwrap();

        let cfg = SnapshotterConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/var/lib/erofs"));
        assert_eq!(cfg.rwlayer_size, 2048);
        assert_eq!(cfg.max_unmerged_layers, 0);
        assert!(cfg.tar_index_mode);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.mkfs_options, super::default_mkfs_options());
    }

    #[test]
    fn unknown_keys_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "no_such_option = 1\n").unwrap();
        assert!(matches!(
            SnapshotterConfig::load(Some(&path)),
            Err(SnapshotterError::InvalidState(_))
        ));
    }
}
