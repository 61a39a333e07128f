//! Tar layer streams to EROFS blobs in one pass.
//!
//! The incoming stream (plain, gzip or zstd, detected by peeking) is fed to
//! `mkfs.erofs --tar` on stdin while an OCI digest of the raw bytes is
//! computed alongside. The subprocess is the unit of isolation: the engine
//! trusts only its exit status, bounded stderr, and the produced image,
//! whose EROFS magic is re-verified before use. Concurrent conversions
//! against distinct outputs are independent.

use containerd_snapshots::api::types::Mount;
use log::debug;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use erofs_common::constants::LAYER_BLOB_NAME;
use erofs_common::utils::{truncate_output, verify_erofs_magic};

use crate::blob::find_layer_blob;
use crate::error::{Result, SnapshotterError};
use crate::metadata::BlobRef;

const STDERR_LIMIT: usize = 1024;
const COPY_CHUNK: usize = 64 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// Detects the stream compression from its first bytes.
pub fn detect_compression(head: &[u8]) -> Compression {
    if head.len() >= 2 && head[..2] == GZIP_MAGIC {
        Compression::Gzip
    } else if head.len() >= 4 && head[..4] == ZSTD_MAGIC {
        Compression::Zstd
    } else {
        Compression::None
    }
}

#[derive(Debug, Clone)]
pub struct DifferConfig {
    /// Extra options passed to every mkfs.erofs invocation.
    pub mkfs_options: Vec<String>,
    /// Index mode (`--tar=i`) keeps tar data external; the default
    /// (`--tar=f`) produces a self-contained image.
    pub tar_index_mode: bool,
}

impl Default for DifferConfig {
    fn default() -> Self {
        DifferConfig {
            mkfs_options: vec![
                "-T".into(),
                "0".into(),
                "--mkfs-time".into(),
                "--quiet".into(),
            ],
            tar_index_mode: false,
        }
    }
}

/// Hashes every byte read through it; shared so the digest survives the
/// adapters stacked on top.
struct TeeReader<R> {
    inner: R,
    state: Arc<Mutex<(Sha256, u64)>>,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let mut state = self.state.lock().expect("digest state poisoned");
            state.0.update(&buf[..n]);
            state.1 += n as u64;
        }
        Ok(n)
    }
}

pub struct TarDiffer {
    config: DifferConfig,
}

impl TarDiffer {
    pub fn new(config: DifferConfig) -> Self {
        TarDiffer { config }
    }

    /// Streams `input` (a possibly-compressed tar) through `mkfs.erofs`
    /// into `output`, returning the blob descriptor with the OCI digest of
    /// the raw input stream.
    pub async fn convert_tar<R>(
        &self,
        input: R,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<BlobRef>
    where
        R: Read + Send + 'static,
    {
        let tar_flag = if self.config.tar_index_mode {
            "--tar=i"
        } else {
            "--tar=f"
        };
        let mut args = self.config.mkfs_options.clone();
        args.push(tar_flag.to_string());
        args.push("--aufs".to_string());

        let output_path = output.to_path_buf();
        let token = token.clone();
        let result = tokio::task::spawn_blocking(move || {
            run_tar_conversion(&args, input, &output_path, &token)
        })
        .await
        .map_err(|err| SnapshotterError::InvalidState(format!("differ task panicked: {err}")))?;

        let (digest, _raw_len) = result?;
        finish_blob(output, digest)
    }

    /// Converts the contents of an upper directory (the commit path) into a
    /// single EROFS blob at `output`.
    pub async fn convert_upper_dir(
        &self,
        snapshot_id: &str,
        upper: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<BlobRef> {
        let fail = |cause: anyhow::Error| SnapshotterError::CommitConversion {
            snapshot_id: snapshot_id.to_string(),
            upper_dir: upper.to_path_buf(),
            source: cause.into(),
        };

        let mut cmd = tokio::process::Command::new("mkfs.erofs");
        cmd.args(&self.config.mkfs_options)
            .arg(output)
            .arg(upper)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(
            "converting upper {} of snapshot {snapshot_id} to {}",
            upper.display(),
            output.display()
        );

        let mut child = cmd.spawn().map_err(|e| fail(e.into()))?;
        let mut stderr_pipe = child.stderr.take();

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                let _ = std::fs::remove_file(output);
                return Err(SnapshotterError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| fail(e.into()))?,
        };

        let mut stderr = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }

        if !status.success() {
            let _ = std::fs::remove_file(output);
            return Err(fail(anyhow::anyhow!(
                "mkfs.erofs exited with {status}: {}",
                truncate_output(&stderr, STDERR_LIMIT)
            )));
        }
        if let Err(err) = verify_erofs_magic(output) {
            let _ = std::fs::remove_file(output);
            return Err(fail(err));
        }

        let digest = digest_file(output)?;
        let size = std::fs::metadata(output)?.len();
        Ok(BlobRef {
            path: output.to_path_buf(),
            digest,
            size,
        })
    }

    /// The Apply surface: feeds a tar stream into the extract target named
    /// by `mounts` and returns the produced layer descriptor. The blob is
    /// written as `layer.erofs` in the owning snapshot directory.
    pub async fn apply<R>(
        &self,
        root: &Path,
        mounts: &[Mount],
        input: R,
        token: &CancellationToken,
    ) -> Result<BlobRef>
    where
        R: Read + Send + 'static,
    {
        let (id, dir) = snapshot_dir_from_mounts(root, mounts)?;
        debug!("applying tar stream to snapshot {id}");
        let output = dir.join(LAYER_BLOB_NAME);
        self.convert_tar(input, &output, token).await
    }

    /// The Compare surface. The upper's blob already is the layer diff, so
    /// the descriptor is a thin wrapper over the existing file.
    pub async fn compare(&self, root: &Path, upper: &[Mount]) -> Result<BlobRef> {
        let (id, _dir) = snapshot_dir_from_mounts(root, upper)?;
        let blob = find_layer_blob(root, &id)?;
        let digest = digest_file(&blob)?;
        let size = std::fs::metadata(&blob)?.len();
        Ok(BlobRef {
            path: blob,
            digest,
            size,
        })
    }
}

/// Blocking half of the tar conversion: peeks the compression, stacks the
/// digest tee under the decompressor, and pumps into the child's stdin with
/// cancellation checks per chunk.
fn run_tar_conversion<R: Read + 'static>(
    args: &[String],
    input: R,
    output: &Path,
    token: &CancellationToken,
) -> Result<(String, u64)> {
    let fail = |cause: anyhow::Error| SnapshotterError::CommitConversion {
        snapshot_id: output
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        upper_dir: output.parent().map(Path::to_path_buf).unwrap_or_default(),
        source: cause.into(),
    };

    let state = Arc::new(Mutex::new((Sha256::new(), 0u64)));
    let mut tee = TeeReader {
        inner: input,
        state: Arc::clone(&state),
    };

    let mut head = [0u8; 4];
    let mut head_len = 0;
    while head_len < head.len() {
        let n = tee.read(&mut head[head_len..]).map_err(|e| fail(e.into()))?;
        if n == 0 {
            break;
        }
        head_len += n;
    }
    let compression = detect_compression(&head[..head_len]);
    debug!("tar stream compression: {compression:?}");

    let rest = std::io::Read::chain(std::io::Cursor::new(head[..head_len].to_vec()), tee);
    let mut decoded: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(rest)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(rest).map_err(|e| fail(e.into()))?),
        Compression::None => Box::new(rest),
    };

    let mut child = std::process::Command::new("mkfs.erofs")
        .args(args)
        .arg(output)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| fail(e.into()))?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut buf = vec![0u8; COPY_CHUNK];
    let copy_result: Result<()> = loop {
        if token.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            let _ = std::fs::remove_file(output);
            return Err(SnapshotterError::Cancelled);
        }
        match decoded.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(err) = stdin.write_all(&buf[..n]) {
                    break Err(fail(err.into()));
                }
            }
            Err(err) => break Err(fail(err.into())),
        }
    };
    drop(stdin);
    // Release the tee's clone of the digest state before unwrapping it.
    drop(decoded);

    let output_data = child.wait_with_output().map_err(|e| fail(e.into()))?;
    if token.is_cancelled() {
        let _ = std::fs::remove_file(output);
        return Err(SnapshotterError::Cancelled);
    }
    copy_result?;

    if !output_data.status.success() {
        let _ = std::fs::remove_file(output);
        return Err(fail(anyhow::anyhow!(
            "mkfs.erofs exited with {}: {}",
            output_data.status,
            truncate_output(&output_data.stderr, STDERR_LIMIT)
        )));
    }

    let state = Arc::try_unwrap(state)
        .map_err(|_| fail(anyhow::anyhow!("digest state still shared")))?
        .into_inner()
        .expect("digest state poisoned");
    Ok((format!("sha256:{:x}", state.0.finalize()), state.1))
}

fn finish_blob(output: &Path, digest: String) -> Result<BlobRef> {
    if let Err(err) = verify_erofs_magic(output) {
        let _ = std::fs::remove_file(output);
        return Err(SnapshotterError::CommitConversion {
            snapshot_id: String::new(),
            upper_dir: output.parent().map(Path::to_path_buf).unwrap_or_default(),
            source: err.into(),
        });
    }
    let size = std::fs::metadata(output)?.len();
    Ok(BlobRef {
        path: output.to_path_buf(),
        digest,
        size,
    })
}

/// Hashes a finished blob file for its descriptor.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Maps an extract recipe back to its owning snapshot directory. The
/// accepted shapes are the ones the engine itself emits: a bind of the
/// upper directory or the ext4 mount of the rwlayer image, both under
/// `root/snapshots/<id>/`.
fn snapshot_dir_from_mounts(root: &Path, mounts: &[Mount]) -> Result<(String, PathBuf)> {
    let snapshots_root = root.join("snapshots");
    for mount in mounts {
        if mount.r#type != "bind" && mount.r#type != "ext4" {
            continue;
        }
        let source = Path::new(&mount.source);
        if let Ok(relative) = source.strip_prefix(&snapshots_root) {
            if let Some(id) = relative.components().next() {
                let id = id.as_os_str().to_string_lossy().into_owned();
                return Ok((id.clone(), snapshots_root.join(id)));
            }
        }
    }
    Err(SnapshotterError::InvalidState(format!(
        "no extract target among {} mount(s); expected a bind or ext4 mount under {}",
        mounts.len(),
        snapshots_root.display()
    )))
}
