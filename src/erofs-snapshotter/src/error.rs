//! Error taxonomy for the snapshotter engine.
//!
//! Every failure the engine can surface is one of these kinds; wrappers keep
//! the underlying cause reachable through `std::error::Error::source`, so
//! callers can match on behaviour rather than message text. At the RPC
//! boundary each kind maps to a stable gRPC status code.

use containerd_snapshots::tonic::Status;
use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotterError>;

type Cause = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SnapshotterError {
    /// No EROFS blob exists for a snapshot yet. Usually means the differ has
    /// not finished writing; resolved through the retry primitive.
    #[error("layer blob not found for snapshot {snapshot_id} in {} (searched: {searched:?})", dir.display())]
    LayerBlobNotFound {
        snapshot_id: String,
        dir: PathBuf,
        searched: Vec<String>,
    },

    /// ext4 loop-mount failure while materialising a writable layer.
    #[error("mount block {} at {}", image.display(), target.display())]
    BlockMount {
        image: PathBuf,
        target: PathBuf,
        #[source]
        source: Cause,
    },

    /// fsmeta creation failed: producer subprocess error, invalid output,
    /// or a waiter giving up.
    #[error("generate fsmeta for {snapshot_id} ({layer_count} layers)")]
    FsmetaGeneration {
        snapshot_id: String,
        layer_count: usize,
        #[source]
        source: Cause,
    },

    /// `mkfs.erofs` failed converting upper contents during commit.
    #[error("convert snapshot {snapshot_id} upper {} to EROFS", upper_dir.display())]
    CommitConversion {
        snapshot_id: String,
        upper_dir: PathBuf,
        #[source]
        source: Cause,
    },

    /// Chain layers disagree on EROFS block size; multi-device composition
    /// is impossible.
    #[error("cannot merge {layer_count} layers: {details}")]
    IncompatibleBlockSize { layer_count: usize, details: String },

    /// A kind-level precondition was violated (e.g. committing a view).
    #[error("invalid snapshot state: {0}")]
    InvalidState(String),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// All retry attempts were exhausted; the last underlying error is the
    /// source.
    #[error("after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<SnapshotterError>,
    },

    #[error("snapshot {0} already exists")]
    AlreadyExists(String),

    #[error("snapshot {0} not found")]
    NotFound(String),

    #[error("metadata store")]
    Store(#[from] sled::Error),

    #[error("metadata encoding")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SnapshotterError {
    /// Walks the cause chain to its end.
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    /// Finds the first `SnapshotterError` in the cause chain (including
    /// `self`) for which `pred` holds.
    pub fn find_in_chain(&self, pred: impl Fn(&SnapshotterError) -> bool) -> Option<&SnapshotterError> {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(snap) = err.downcast_ref::<SnapshotterError>() {
                if pred(snap) {
                    return Some(snap);
                }
            }
            current = err.source();
        }
        None
    }

    /// True if this error, or any cause below it, is a missing layer blob.
    pub fn is_layer_blob_not_found(&self) -> bool {
        self.find_in_chain(|e| matches!(e, SnapshotterError::LayerBlobNotFound { .. }))
            .is_some()
    }

    /// True if this error, or any cause below it, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.find_in_chain(|e| matches!(e, SnapshotterError::Cancelled))
            .is_some()
    }
}

impl From<SnapshotterError> for Status {
    fn from(err: SnapshotterError) -> Self {
        // Render the full cause chain; tonic::Status carries only a message.
        let mut msg = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }

        match &err {
            SnapshotterError::NotFound(_) | SnapshotterError::LayerBlobNotFound { .. } => {
                Status::not_found(msg)
            }
            SnapshotterError::AlreadyExists(_) => Status::already_exists(msg),
            SnapshotterError::InvalidState(_) | SnapshotterError::IncompatibleBlockSize { .. } => {
                Status::failed_precondition(msg)
            }
            SnapshotterError::Cancelled => Status::cancelled(msg),
            SnapshotterError::RetryExhausted { source, .. } => {
                let inner: Status = Status::from(SnapshotterError::clone_kind(source));
                Status::new(inner.code(), msg)
            }
            _ => Status::internal(msg),
        }
    }
}

impl SnapshotterError {
    // Maps a borrowed error to a representative owned value of the same
    // kind, for status-code selection only.
    fn clone_kind(err: &SnapshotterError) -> SnapshotterError {
        match err {
            SnapshotterError::LayerBlobNotFound {
                snapshot_id,
                dir,
                searched,
            } => SnapshotterError::LayerBlobNotFound {
                snapshot_id: snapshot_id.clone(),
                dir: dir.clone(),
                searched: searched.clone(),
            },
            SnapshotterError::NotFound(k) => SnapshotterError::NotFound(k.clone()),
            SnapshotterError::AlreadyExists(k) => SnapshotterError::AlreadyExists(k.clone()),
            SnapshotterError::InvalidState(m) => SnapshotterError::InvalidState(m.clone()),
            SnapshotterError::Cancelled => SnapshotterError::Cancelled,
            SnapshotterError::IncompatibleBlockSize {
                layer_count,
                details,
            } => SnapshotterError::IncompatibleBlockSize {
                layer_count: *layer_count,
                details: details.clone(),
            },
            other => SnapshotterError::InvalidState(other.to_string()),
        }
    }
}
