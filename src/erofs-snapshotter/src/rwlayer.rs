//! Writable ext4 block layer lifecycle for active snapshots.
//!
//! When a block size is configured, every extract snapshot gets a sparse
//! ext4 image (`rwlayer.img`) that is loop-attached and host-mounted so the
//! differ can write through it. Each step is idempotent and partial failures
//! roll back in reverse order; the commit/remove paths tear everything down
//! again through the same manager.

use log::{debug, warn};
use nix::mount::{MntFlags, MsFlags};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use erofs_common::constants::RWLAYER_IMAGE_NAME;
use erofs_common::utils::truncate_output;

use crate::error::{Result, SnapshotterError};
use crate::mount_state::MountTracker;
use crate::retry::{retry_with_result, RetryConfig};

/// ext4 superblock magic, little-endian u16 at offset 1024 + 56.
const EXT4_MAGIC_OFFSET: u64 = 1024 + 56;
const EXT4_MAGIC: u16 = 0xEF53;

const STDERR_LIMIT: usize = 1024;

/// A fully materialised writable layer.
#[derive(Debug, Clone)]
pub struct RwLayer {
    pub image: PathBuf,
    pub device: String,
    pub mountpoint: PathBuf,
}

pub struct WritableLayerManager {
    size_bytes: u64,
    tracker: Arc<MountTracker>,
    /// snapshot id -> attached loop device. Held for the whole attach
    /// window; this is the engine's lease on the device.
    devices: Mutex<HashMap<String, String>>,
}

impl WritableLayerManager {
    pub fn new(size_bytes: u64, tracker: Arc<MountTracker>) -> Self {
        WritableLayerManager {
            size_bytes,
            tracker,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// False means directory mode: no block image is ever created.
    pub fn configured(&self) -> bool {
        self.size_bytes > 0
    }

    pub fn image_path(snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join(RWLAYER_IMAGE_NAME)
    }

    pub fn mountpoint(snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join("rw")
    }

    /// Allocates, formats, attaches and host-mounts the writable layer for
    /// `id`. On any failure the completed steps are undone before the error
    /// is returned.
    pub async fn setup(
        &self,
        id: &str,
        snapshot_dir: &Path,
        token: &CancellationToken,
    ) -> Result<RwLayer> {
        let image = Self::image_path(snapshot_dir);
        let mountpoint = Self::mountpoint(snapshot_dir);

        self.allocate(&image)?;
        if let Err(err) = self.format(&image).await {
            let _ = std::fs::remove_file(&image);
            return Err(err);
        }
        let device = match self.attach(id, &image).await {
            Ok(device) => device,
            Err(err) => {
                let _ = std::fs::remove_file(&image);
                return Err(err);
            }
        };
        if let Err(err) = self.mount(id, &device, &image, &mountpoint) {
            self.detach(id).await;
            let _ = std::fs::remove_file(&image);
            return Err(err);
        }

        if token.is_cancelled() {
            self.teardown(id, snapshot_dir, true, token).await;
            return Err(SnapshotterError::Cancelled);
        }

        Ok(RwLayer {
            image,
            device,
            mountpoint,
        })
    }

    /// Allocates and formats the image without attaching or mounting it.
    /// Used for non-extract actives, where the runtime performs the ext4
    /// loop mount from the recipe.
    pub async fn prepare_image(&self, snapshot_dir: &Path) -> Result<PathBuf> {
        let image = Self::image_path(snapshot_dir);
        self.allocate(&image)?;
        if let Err(err) = self.format(&image).await {
            let _ = std::fs::remove_file(&image);
            return Err(err);
        }
        Ok(image)
    }

    /// Creates the sparse image file. Safe to repeat: an existing file of
    /// the right size is left alone.
    fn allocate(&self, image: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(image)?;
        if file.metadata()?.len() != self.size_bytes {
            file.set_len(self.size_bytes)?;
        }
        Ok(())
    }

    /// Formats the image as ext4 unless a valid ext4 superblock is already
    /// present (which makes repeated calls safe instead of destructive).
    async fn format(&self, image: &Path) -> Result<()> {
        if is_ext4_formatted(image)? {
            debug!("{} already formatted, skipping mkfs.ext4", image.display());
            return Ok(());
        }

        let output = tokio::process::Command::new("mkfs.ext4")
            .arg("-F")
            .arg("-q")
            .arg("-b")
            .arg("4096")
            .arg(image)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SnapshotterError::BlockMount {
                image: image.to_path_buf(),
                target: PathBuf::new(),
                source: anyhow::anyhow!(
                    "mkfs.ext4 exited with {}: {}",
                    output.status,
                    truncate_output(&output.stderr, STDERR_LIMIT)
                )
                .into(),
            });
        }
        Ok(())
    }

    /// Loop-attaches the image (auto-clear off; the engine detaches
    /// explicitly) and labels the device with a best-effort serial for
    /// external identification. The serial is never read back.
    async fn attach(&self, id: &str, image: &Path) -> Result<String> {
        if let Some(existing) = self.devices.lock().expect("device map poisoned").get(id) {
            return Ok(existing.clone());
        }

        let output = tokio::process::Command::new("losetup")
            .arg("--find")
            .arg("--show")
            .arg(image)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SnapshotterError::BlockMount {
                image: image.to_path_buf(),
                target: PathBuf::new(),
                source: anyhow::anyhow!(
                    "losetup exited with {}: {}",
                    output.status,
                    truncate_output(&output.stderr, STDERR_LIMIT)
                )
                .into(),
            });
        }
        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(SnapshotterError::BlockMount {
                image: image.to_path_buf(),
                target: PathBuf::new(),
                source: anyhow::anyhow!("losetup reported no device").into(),
            });
        }

        if let Some(name) = Path::new(&device).file_name().and_then(|n| n.to_str()) {
            let serial_path = format!("/sys/block/{name}/serial");
            if let Err(err) = std::fs::write(&serial_path, format!("erofs-{id}")) {
                debug!("cannot write loop serial {serial_path}: {err}");
            }
        }

        self.devices
            .lock()
            .expect("device map poisoned")
            .insert(id.to_string(), device.clone());
        debug!("attached {} at {device}", image.display());
        Ok(device)
    }

    fn mount(&self, id: &str, device: &str, image: &Path, mountpoint: &Path) -> Result<()> {
        if self.tracker.is_mounted(id) {
            return Ok(());
        }
        std::fs::create_dir_all(mountpoint)?;
        nix::mount::mount(
            Some(Path::new(device)),
            mountpoint,
            Some("ext4"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|err| SnapshotterError::BlockMount {
            image: image.to_path_buf(),
            target: mountpoint.to_path_buf(),
            source: Box::new(std::io::Error::from(err)),
        })?;
        self.tracker.set_mounted(id);

        std::fs::create_dir_all(mountpoint.join("upper"))?;
        std::fs::create_dir_all(mountpoint.join("work"))?;
        Ok(())
    }

    /// Flushes the mounted upper before commit reads it.
    pub async fn sync(&self, id: &str) {
        if !self.tracker.is_mounted(id) {
            return;
        }
        if let Err(err) = tokio::process::Command::new("sync").status().await {
            warn!("sync before commit of {id} failed: {err}");
        }
    }

    /// Unmounts if this engine performed the mount. Transient EBUSY is
    /// retried briefly before giving up.
    pub async fn unmount(&self, id: &str, mountpoint: &Path, token: &CancellationToken) {
        if !self.tracker.needs_cleanup(id) {
            return;
        }
        let cfg = RetryConfig {
            max_attempts: 3,
            initial_wait: Duration::from_millis(100),
            max_wait: Duration::from_millis(500),
            multiplier: 2.0,
        };
        let result = retry_with_result(token, &cfg, || async {
            nix::mount::umount2(mountpoint, MntFlags::empty())
                .map_err(|err| SnapshotterError::Io(std::io::Error::from(err)))
        })
        .await;
        match result {
            Ok(()) => self.tracker.set_unmounted(id),
            Err(err) => warn!("unmount {} failed: {err}", mountpoint.display()),
        }
    }

    /// Detaches the loop device, releasing the engine's lease.
    pub async fn detach(&self, id: &str) {
        let device = self.devices.lock().expect("device map poisoned").remove(id);
        let Some(device) = device else { return };
        match tokio::process::Command::new("losetup")
            .arg("-d")
            .arg(&device)
            .output()
            .await
        {
            Ok(output) if output.status.success() => debug!("detached {device}"),
            Ok(output) => warn!(
                "losetup -d {device} exited with {}: {}",
                output.status,
                truncate_output(&output.stderr, STDERR_LIMIT)
            ),
            Err(err) => warn!("losetup -d {device} failed: {err}"),
        }
    }

    /// Reverse-order teardown: unmount, detach, then (optionally) unlink the
    /// image. Best-effort; failures are logged, not surfaced, so Remove and
    /// Commit can always make progress.
    pub async fn teardown(
        &self,
        id: &str,
        snapshot_dir: &Path,
        remove_image: bool,
        token: &CancellationToken,
    ) {
        let mountpoint = Self::mountpoint(snapshot_dir);
        self.unmount(id, &mountpoint, token).await;
        self.detach(id).await;
        if remove_image {
            let image = Self::image_path(snapshot_dir);
            if let Err(err) = std::fs::remove_file(&image) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("remove {} failed: {err}", image.display());
                }
            }
        }
    }
}

fn is_ext4_formatted(image: &Path) -> Result<bool> {
    let mut file = match std::fs::File::open(image) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() < EXT4_MAGIC_OFFSET + 2 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(EXT4_MAGIC_OFFSET))?;
    let mut buf = [0u8; 2];
    file.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf) == EXT4_MAGIC)
}
