//! Locating a snapshot's EROFS layer blob on disk.
//!
//! Committed layers are written either under the canonical name
//! `layer.erofs` or as `sha256-<hex>.erofs` when named by digest. Because a
//! View can race a Prepare+Commit whose differ is still writing, lookups go
//! through the retry primitive.

use log::trace;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use erofs_common::constants::LAYER_BLOB_NAME;

use crate::error::{Result, SnapshotterError};
use crate::retry::{retry_with_result, RetryConfig};

const DIGEST_BLOB_PREFIX: &str = "sha256-";
const DIGEST_BLOB_SUFFIX: &str = ".erofs";

/// Search patterns, in order, reported when nothing matches.
fn searched_patterns() -> Vec<String> {
    vec![
        LAYER_BLOB_NAME.to_string(),
        format!("{DIGEST_BLOB_PREFIX}<hex>{DIGEST_BLOB_SUFFIX}"),
    ]
}

/// Returns the path of the layer blob for snapshot `id`, or
/// [`SnapshotterError::LayerBlobNotFound`] carrying the patterns attempted.
pub fn find_layer_blob(root: &Path, id: &str) -> Result<PathBuf> {
    let dir = root.join("snapshots").join(id);

    let canonical = dir.join(LAYER_BLOB_NAME);
    if canonical.is_file() {
        return Ok(canonical);
    }

    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(DIGEST_BLOB_PREFIX)
                && name.ends_with(DIGEST_BLOB_SUFFIX)
                && entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            {
                trace!("resolved layer blob for {id} by digest name: {name}");
                return Ok(entry.path());
            }
        }
    }

    Err(SnapshotterError::LayerBlobNotFound {
        snapshot_id: id.to_string(),
        dir,
        searched: searched_patterns(),
    })
}

/// [`find_layer_blob`] wrapped in the retry primitive, for callers racing
/// an in-flight differ.
pub async fn resolve_layer_blob(
    root: &Path,
    id: &str,
    cfg: &RetryConfig,
    token: &CancellationToken,
) -> Result<PathBuf> {
    retry_with_result(token, cfg, || {
        let root = root.to_path_buf();
        let id = id.to_string();
        async move { find_layer_blob(&root, &id) }
    })
    .await
}
