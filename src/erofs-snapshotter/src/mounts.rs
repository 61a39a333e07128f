//! Mount recipe planning.
//!
//! The planner turns a resolved chain (blob paths) plus an optional fsmeta
//! descriptor and an optional writable upper into the structured mount list
//! handed back over the snapshot RPC. Translating a recipe into actual
//! mount(2) calls is the runtime's concern.
//!
//! Ordering rules, in one place because they are easy to invert:
//!   - EROFS `device=` options follow the superblock device table and are
//!     oldest-first.
//!   - overlay `lowerdir` is newest-first (the leftmost entry is the
//!     topmost layer).

use containerd_snapshots::api::types::Mount;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, SnapshotterError};
use crate::layer_order::LayerSequence;

/// Writable side of an active snapshot's recipe.
pub enum ActiveUpper<'a> {
    /// A loop-backed ext4 image mounted read-write; upper and work live
    /// inside it.
    Block {
        image: &'a Path,
        mountpoint: &'a Path,
    },
    /// Plain directories (no block image configured).
    Directory { upper: &'a Path, work: &'a Path },
}

/// Per-engine mount planner.
///
/// `force_loop` memoises whether the kernel accepted direct file-backed
/// EROFS mounts: recipes omit the `loop` option until a failure is reported,
/// then carry it forever. Per-engine rather than global so tests can reset
/// the probe.
#[derive(Debug, Default)]
pub struct MountPlanner {
    force_loop: AtomicBool,
}

impl MountPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a direct file-backed EROFS mount failed; all further
    /// recipes request loop devices.
    pub fn note_loop_required(&self) {
        self.force_loop.store(true, Ordering::SeqCst);
    }

    /// Forgets the memoised probe result.
    pub fn reset_loop_probe(&self) {
        self.force_loop.store(false, Ordering::SeqCst);
    }

    fn erofs_options(&self) -> Vec<String> {
        let mut options = vec!["ro".to_string()];
        if self.force_loop.load(Ordering::SeqCst) {
            options.push("loop".to_string());
        }
        options
    }

    /// Recipe for a committed chain (View, or the read-only side of an
    /// active snapshot). `blobs` may be in either direction.
    pub fn plan_committed_view(
        &self,
        blobs: &LayerSequence,
        fsmeta: Option<&Path>,
    ) -> Result<Vec<Mount>> {
        if blobs.is_empty() {
            return Err(SnapshotterError::InvalidState(
                "cannot plan mounts for an empty layer chain".into(),
            ));
        }

        if blobs.len() == 1 {
            let blob = &blobs.ids()[0];
            return Ok(vec![Mount {
                r#type: "erofs".into(),
                source: blob.clone(),
                target: String::new(),
                options: self.erofs_options(),
            }]);
        }

        if let Some(fsmeta) = fsmeta {
            let mut options = self.erofs_options();
            for blob in blobs.to_oldest_first().ids() {
                options.push(format!("device={blob}"));
            }
            return Ok(vec![Mount {
                r#type: "erofs".into(),
                source: fsmeta.to_string_lossy().into_owned(),
                target: String::new(),
                options,
            }]);
        }

        // No fsmeta: overlay over the individual layers.
        Ok(vec![Mount {
            r#type: "overlay".into(),
            source: "overlay".into(),
            target: String::new(),
            options: vec![format!(
                "lowerdir={}",
                blobs.to_newest_first().ids().join(":")
            )],
        }])
    }

    /// Recipe for an active snapshot: the committed lower side (possibly
    /// empty for a root snapshot) plus the writable upper.
    pub fn plan_active(
        &self,
        blobs: &LayerSequence,
        fsmeta: Option<&Path>,
        upper: ActiveUpper<'_>,
    ) -> Result<Vec<Mount>> {
        let mut mounts = Vec::new();

        let (upper_dir, work_dir, block) = match upper {
            ActiveUpper::Block { image, mountpoint } => {
                mounts.push(Mount {
                    r#type: "ext4".into(),
                    source: image.to_string_lossy().into_owned(),
                    target: mountpoint.to_string_lossy().into_owned(),
                    options: vec!["rw".into(), "loop".into()],
                });
                (mountpoint.join("upper"), mountpoint.join("work"), true)
            }
            ActiveUpper::Directory { upper, work } => (upper.to_path_buf(), work.to_path_buf(), false),
        };

        if blobs.is_empty() {
            // Root active snapshot: the upper alone is the filesystem.
            if !block {
                mounts.push(Mount {
                    r#type: "bind".into(),
                    source: upper_dir.to_string_lossy().into_owned(),
                    target: String::new(),
                    options: vec!["bind".into(), "rw".into()],
                });
            }
            return Ok(mounts);
        }

        let mut lowers = self.plan_committed_view(blobs, fsmeta)?;
        let overlay_lower = match lowers[0].r#type.as_str() {
            // A single EROFS mount (plain or multi-device) becomes the one
            // lower of the overlay; the runtime materialises it at the
            // mount's target.
            "erofs" => {
                lowers[0].target = "lower".into();
                mounts.append(&mut lowers);
                "lower".to_string()
            }
            // Already an overlay of per-layer lowers: reuse its lowerdir.
            _ => {
                let opts = lowers.remove(0).options;
                opts.into_iter()
                    .find_map(|o| o.strip_prefix("lowerdir=").map(str::to_string))
                    .expect("overlay recipe carries lowerdir")
            }
        };

        mounts.push(Mount {
            r#type: "overlay".into(),
            source: "overlay".into(),
            target: String::new(),
            options: vec![
                format!("lowerdir={overlay_lower}"),
                format!("upperdir={}", upper_dir.display()),
                format!("workdir={}", work_dir.display()),
            ],
        });
        Ok(mounts)
    }

    /// Recipe handed to the tar uploader for an extract snapshot: a plain
    /// bind of the upper directory the differ writes into.
    pub fn plan_extract(&self, upper_dir: &Path) -> Vec<Mount> {
        vec![Mount {
            r#type: "bind".into(),
            source: upper_dir.to_string_lossy().into_owned(),
            target: String::new(),
            options: vec!["bind".into(), "rw".into()],
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> MountPlanner {
        MountPlanner::new()
    }

    #[test]
    fn single_layer_is_one_erofs_mount() {
        let blobs = LayerSequence::new_newest_first(["/root/snapshots/1/layer.erofs"]);
        let mounts = planner().plan_committed_view(&blobs, None).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "erofs");
        assert_eq!(mounts[0].source, "/root/snapshots/1/layer.erofs");
        assert_eq!(mounts[0].options, vec!["ro"]);
    }

    #[test]
    fn multi_device_lists_devices_oldest_first() {
        // Chain newest-first [C, B, A] must emit devices A, B, C.
        let blobs = LayerSequence::new_newest_first(["C", "B", "A"]);
        let mounts = planner()
            .plan_committed_view(&blobs, Some(Path::new("/root/snapshots/3/fsmeta.erofs")))
            .unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "erofs");
        assert_eq!(mounts[0].source, "/root/snapshots/3/fsmeta.erofs");
        assert_eq!(
            mounts[0].options,
            vec!["ro", "device=A", "device=B", "device=C"]
        );
    }

    #[test]
    fn overlay_fallback_lowerdir_is_newest_first() {
        let blobs = LayerSequence::new_newest_first(["C", "B", "A"]);
        let mounts = planner().plan_committed_view(&blobs, None).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "overlay");
        assert_eq!(mounts[0].options, vec!["lowerdir=C:B:A"]);
    }

    #[test]
    fn oldest_first_input_produces_identical_recipes() {
        let newest = LayerSequence::new_newest_first(["C", "B", "A"]);
        let oldest = newest.to_oldest_first();
        let p = planner();

        let a = p.plan_committed_view(&newest, None).unwrap();
        let b = p.plan_committed_view(&oldest, None).unwrap();
        assert_eq!(a[0].options, b[0].options);
    }

    #[test]
    fn empty_chain_rejected() {
        let blobs = LayerSequence::new_newest_first(Vec::<String>::new());
        assert!(planner().plan_committed_view(&blobs, None).is_err());
    }

    #[test]
    fn loop_probe_is_memoised_and_resettable() {
        let p = planner();
        let blobs = LayerSequence::new_newest_first(["A"]);

        let before = p.plan_committed_view(&blobs, None).unwrap();
        assert!(!before[0].options.contains(&"loop".to_string()));

        p.note_loop_required();
        let after = p.plan_committed_view(&blobs, None).unwrap();
        assert!(after[0].options.contains(&"loop".to_string()));

        p.reset_loop_probe();
        let reset = p.plan_committed_view(&blobs, None).unwrap();
        assert!(!reset[0].options.contains(&"loop".to_string()));
    }

    #[test]
    fn active_block_recipe_has_ext4_then_overlay() {
        let blobs = LayerSequence::new_newest_first(["C", "B", "A"]);
        let mounts = planner()
            .plan_active(
                &blobs,
                None,
                ActiveUpper::Block {
                    image: Path::new("/root/snapshots/9/rwlayer.img"),
                    mountpoint: Path::new("/root/snapshots/9/rw"),
                },
            )
            .unwrap();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].r#type, "ext4");
        assert_eq!(mounts[0].source, "/root/snapshots/9/rwlayer.img");
        assert!(mounts[0].options.contains(&"loop".to_string()));

        assert_eq!(mounts[1].r#type, "overlay");
        assert!(mounts[1]
            .options
            .contains(&"lowerdir=C:B:A".to_string()));
        assert!(mounts[1]
            .options
            .contains(&"upperdir=/root/snapshots/9/rw/upper".to_string()));
        assert!(mounts[1]
            .options
            .contains(&"workdir=/root/snapshots/9/rw/work".to_string()));
    }

    #[test]
    fn active_with_fsmeta_overlays_single_lower() {
        let blobs = LayerSequence::new_newest_first(["B", "A"]);
        let mounts = planner()
            .plan_active(
                &blobs,
                Some(Path::new("/root/snapshots/2/fsmeta.erofs")),
                ActiveUpper::Directory {
                    upper: Path::new("/root/snapshots/9/fs"),
                    work: Path::new("/root/snapshots/9/work"),
                },
            )
            .unwrap();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].r#type, "erofs");
        assert_eq!(mounts[0].target, "lower");
        assert_eq!(mounts[1].r#type, "overlay");
        assert!(mounts[1].options.contains(&"lowerdir=lower".to_string()));
    }

    #[test]
    fn root_active_directory_mode_is_bind_rw() {
        let blobs = LayerSequence::new_newest_first(Vec::<String>::new());
        let mounts = planner()
            .plan_active(
                &blobs,
                None,
                ActiveUpper::Directory {
                    upper: Path::new("/root/snapshots/7/fs"),
                    work: Path::new("/root/snapshots/7/work"),
                },
            )
            .unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "bind");
        assert_eq!(mounts[0].source, "/root/snapshots/7/fs");
        assert_eq!(mounts[0].options, vec!["bind", "rw"]);
    }

    #[test]
    fn extract_recipe_binds_upper() {
        let mounts = planner().plan_extract(Path::new("/root/snapshots/5/rw/upper"));
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "bind");
        assert_eq!(mounts[0].source, "/root/snapshots/5/rw/upper");
    }
}
