//! Multi-device EROFS descriptor (fsmeta) generation.
//!
//! A tip's fsmeta is a synthetic EROFS image whose device table references
//! every layer blob of the chain in oldest-first order, letting one mount
//! present the whole stack. Exactly one producer may build it per tip: the
//! target path doubles as an O_CREAT|O_EXCL placeholder, so concurrent
//! callers (even from a second daemon racing over the same root) degrade to
//! waiters polling for the finished file.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use erofs_common::constants::FSMETA_NAME;
use erofs_common::utils::{read_erofs_block_size, truncate_output, verify_erofs_magic};

use crate::error::{Result, SnapshotterError};
use crate::layer_order::LayerSequence;

/// Cap on subprocess stderr embedded in errors.
const STDERR_LIMIT: usize = 1024;

/// How often a waiter re-checks the placeholder.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Path of the fsmeta descriptor for a tip snapshot directory.
pub fn fsmeta_path(root: &Path, tip_id: &str) -> PathBuf {
    root.join("snapshots").join(tip_id).join(FSMETA_NAME)
}

pub struct FsmetaBuilder {
    root: PathBuf,
    mkfs_options: Vec<String>,
    wait_timeout: Duration,
    builds: AtomicUsize,
}

impl FsmetaBuilder {
    pub fn new(root: PathBuf, mkfs_options: Vec<String>, wait_timeout: Duration) -> Self {
        FsmetaBuilder {
            root,
            mkfs_options,
            wait_timeout,
            builds: AtomicUsize::new(0),
        }
    }

    /// Number of mkfs.erofs invocations this builder has performed. Waiters
    /// do not count; the producer/waiter protocol keeps this at one per tip.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Ensures `snapshots/<tip_id>/fsmeta.erofs` exists and is complete,
    /// building it if this caller wins the placeholder race.
    ///
    /// `layers` holds the chain's blob paths in either direction; the device
    /// table is always emitted oldest-first. Index 0 of the resulting device
    /// list is the fsmeta image itself, which is why descriptor writers put
    /// a placeholder entry first.
    pub async fn ensure_fsmeta(
        &self,
        tip_id: &str,
        layers: &LayerSequence,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        if layers.is_empty() {
            return Err(SnapshotterError::InvalidState(format!(
                "cannot build fsmeta for {tip_id}: empty layer chain"
            )));
        }
        let layers = layers.to_oldest_first();
        self.check_block_sizes(&layers)?;

        let target = fsmeta_path(&self.root, tip_id);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(_) => self.produce(tip_id, &layers, &target, token).await,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                self.wait_for(tip_id, &layers, &target, token).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All layers must agree on the EROFS block size or the kernel will
    /// refuse the combined device table.
    fn check_block_sizes(&self, layers: &LayerSequence) -> Result<()> {
        let mut first: Option<(u32, &str)> = None;
        for path in layers.ids() {
            let size = read_erofs_block_size(Path::new(path)).map_err(|err| {
                SnapshotterError::FsmetaGeneration {
                    snapshot_id: path.clone(),
                    layer_count: layers.len(),
                    source: err.into(),
                }
            })?;
            match first {
                None => first = Some((size, path)),
                Some((expected, _)) if expected == size => {}
                Some((expected, first_path)) => {
                    return Err(SnapshotterError::IncompatibleBlockSize {
                        layer_count: layers.len(),
                        details: format!(
                            "{path} uses {size} bytes, {first_path} uses {expected} bytes"
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn produce(
        &self,
        tip_id: &str,
        layers: &LayerSequence,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        let result = self.run_mkfs(tip_id, layers, target, token).await;
        if result.is_err() {
            // Leave no placeholder behind so a later caller can retry.
            if let Err(err) = std::fs::remove_file(target) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove fsmeta placeholder {}: {err}", target.display());
                }
            }
        }
        result
    }

    async fn run_mkfs(
        &self,
        tip_id: &str,
        layers: &LayerSequence,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        let tip_dir = target.parent().expect("fsmeta path has a parent");
        let tmp_path = tip_dir.join(format!("{FSMETA_NAME}.tmp-{}", Uuid::new_v4()));
        // mkfs.erofs wants a source tree; the descriptor carries no inodes of
        // its own, so an empty staging directory does.
        let staging = tempfile::tempdir_in(tip_dir)?;

        let mut cmd = tokio::process::Command::new("mkfs.erofs");
        cmd.args(&self.mkfs_options);
        for layer in layers.ids() {
            cmd.arg(format!("--blobdev={layer}"));
        }
        cmd.arg(&tmp_path)
            .arg(staging.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(
            "building fsmeta for {tip_id}: {} layers, target {}",
            layers.len(),
            target.display()
        );
        self.builds.fetch_add(1, Ordering::SeqCst);

        let fail = |cause: Box<dyn std::error::Error + Send + Sync>| {
            SnapshotterError::FsmetaGeneration {
                snapshot_id: tip_id.to_string(),
                layer_count: layers.len(),
                source: cause,
            }
        };

        let mut child = cmd.spawn().map_err(|e| fail(e.into()))?;
        let mut stderr_pipe = child.stderr.take();

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                let _ = std::fs::remove_file(&tmp_path);
                return Err(SnapshotterError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| fail(e.into()))?,
        };

        let mut stderr = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }

        if !status.success() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(fail(
                anyhow::anyhow!(
                    "mkfs.erofs exited with {status}: {}",
                    truncate_output(&stderr, STDERR_LIMIT)
                )
                .into(),
            ));
        }

        if let Err(err) = verify_erofs_magic(&tmp_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(fail(err.into()));
        }

        std::fs::rename(&tmp_path, target)?;
        debug!("fsmeta ready at {}", target.display());
        Ok(target.to_path_buf())
    }

    /// Polls until the producer's rename lands (file becomes non-empty),
    /// bounded by the configured deadline.
    async fn wait_for(
        &self,
        tip_id: &str,
        layers: &LayerSequence,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            match std::fs::metadata(target) {
                Ok(meta) if meta.len() > 0 => return Ok(target.to_path_buf()),
                // Producer failed and unlinked the placeholder; report it so
                // the caller can fall back (or retry, recreating the file).
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SnapshotterError::FsmetaGeneration {
                        snapshot_id: tip_id.to_string(),
                        layer_count: layers.len(),
                        source: anyhow::anyhow!("producer abandoned fsmeta generation").into(),
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SnapshotterError::FsmetaGeneration {
                    snapshot_id: tip_id.to_string(),
                    layer_count: layers.len(),
                    source: anyhow::anyhow!(
                        "timed out after {:?} waiting for another producer",
                        self.wait_timeout
                    )
                    .into(),
                });
            }
            tokio::select! {
                _ = token.cancelled() => return Err(SnapshotterError::Cancelled),
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erofs_common::constants::EROFS_MAGIC;
    use std::fs;
    use std::io::Write;

    fn fake_erofs(dir: &Path, name: &str, blkszbits: u8) -> PathBuf {
        let path = dir.join(name);
        let mut data = vec![0u8; 2048];
        data[1024..1028].copy_from_slice(&EROFS_MAGIC.to_le_bytes());
        data[1036] = blkszbits;
        fs::File::create(&path).unwrap().write_all(&data).unwrap();
        path
    }

    fn builder(root: &Path) -> FsmetaBuilder {
        FsmetaBuilder::new(root.to_path_buf(), vec!["--quiet".into()], Duration::from_millis(300))
    }

    fn tip_dir(root: &Path, id: &str) -> PathBuf {
        let dir = root.join("snapshots").join(id);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn placeholder_race_has_one_winner() {
        let root = tempfile::tempdir().unwrap();
        let dir = tip_dir(root.path(), "tip");
        let target = dir.join(FSMETA_NAME);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..20)
                .map(|_| {
                    let target = target.clone();
                    scope.spawn(move || {
                        fs::OpenOptions::new()
                            .write(true)
                            .create_new(true)
                            .open(&target)
                            .is_ok() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn mismatched_block_sizes_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = tip_dir(root.path(), "tip");
        let a = fake_erofs(&dir, "a.erofs", 12);
        let b = fake_erofs(&dir, "b.erofs", 9);

        let layers = LayerSequence::new_oldest_first([
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ]);
        let err = builder(root.path())
            .ensure_fsmeta("tip", &layers, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SnapshotterError::IncompatibleBlockSize { layer_count, details } => {
                assert_eq!(layer_count, 2);
                assert!(details.contains("512"));
                assert!(details.contains("4096"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_rejected() {
        let root = tempfile::tempdir().unwrap();
        tip_dir(root.path(), "tip");
        let layers = LayerSequence::new_oldest_first(Vec::<String>::new());
        let err = builder(root.path())
            .ensure_fsmeta("tip", &layers, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));
    }

    #[tokio::test]
    async fn waiter_returns_when_producer_finishes() {
        let root = tempfile::tempdir().unwrap();
        let dir = tip_dir(root.path(), "tip");
        let a = fake_erofs(&dir, "a.erofs", 12);
        let target = dir.join(FSMETA_NAME);

        // Simulate another producer holding the placeholder.
        fs::File::create(&target).unwrap();

        let filler = {
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                fs::write(&target, b"finished fsmeta contents").unwrap();
            })
        };

        let layers = LayerSequence::new_oldest_first([a.to_string_lossy().into_owned()]);
        let b = builder(root.path());
        let path = b
            .ensure_fsmeta("tip", &layers, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, target);
        // This caller was a waiter, never a producer.
        assert_eq!(b.build_count(), 0);
        filler.await.unwrap();
    }

    #[tokio::test]
    async fn waiter_times_out_on_stuck_producer() {
        let root = tempfile::tempdir().unwrap();
        let dir = tip_dir(root.path(), "tip");
        let a = fake_erofs(&dir, "a.erofs", 12);
        let target = dir.join(FSMETA_NAME);
        fs::File::create(&target).unwrap();

        let layers = LayerSequence::new_oldest_first([a.to_string_lossy().into_owned()]);
        let err = builder(root.path())
            .ensure_fsmeta("tip", &layers, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::FsmetaGeneration { .. }));
    }

    #[tokio::test]
    async fn waiter_observes_cancellation() {
        let root = tempfile::tempdir().unwrap();
        let dir = tip_dir(root.path(), "tip");
        let a = fake_erofs(&dir, "a.erofs", 12);
        fs::File::create(dir.join(FSMETA_NAME)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let layers = LayerSequence::new_oldest_first([a.to_string_lossy().into_owned()]);
        let err = builder(root.path())
            .ensure_fsmeta("tip", &layers, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::Cancelled));
    }
}
