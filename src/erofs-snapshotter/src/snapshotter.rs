//! The snapshot engine: lifecycle state machine, commit pipeline and the
//! containerd-facing `Snapshotter` implementation.

use containerd_snapshots::api::types::Mount;
use containerd_snapshots::tonic::Status;
use containerd_snapshots::{tonic, Info, Kind, Snapshotter, Usage};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use erofs_common::constants::{EXTRACT_SNAPSHOT_LABEL, LAYER_BLOB_NAME};

use crate::blob::{find_layer_blob, resolve_layer_blob};
use crate::config::SnapshotterConfig;
use crate::differ::{digest_file, DifferConfig, TarDiffer};
use crate::error::{Result, SnapshotterError};
use crate::fsmeta::{fsmeta_path, FsmetaBuilder};
use crate::layer_order::LayerSequence;
use crate::metadata::{kind_copy, BlobRef, MetaStore, SnapshotRecord};
use crate::mount_state::MountTracker;
use crate::mounts::{ActiveUpper, MountPlanner};
use crate::retry::RetryConfig;
use crate::rwlayer::WritableLayerManager;
use crate::vmdk;

/// Returns true when the final path segment of a snapshot key marks it as a
/// tar extraction target (`.../extract-<n>`).
fn is_extract_key(key: &str) -> bool {
    key.rsplit('/').next().unwrap_or(key).starts_with("extract")
}

/// A snapshot is an extract target when the reserved label says so or its
/// key carries the conventional prefix.
fn is_extract_snapshot(key: &str, labels: &HashMap<String, String>) -> bool {
    labels.get(EXTRACT_SNAPSHOT_LABEL).map(String::as_str) == Some("true") || is_extract_key(key)
}

fn record_to_info(record: &SnapshotRecord) -> Info {
    Info {
        kind: kind_copy(&record.kind),
        name: record.key.clone(),
        parent: record.parent.clone(),
        labels: record.labels.clone(),
        ..Info::default()
    }
}

pub struct ErofsSnapshotter {
    config: SnapshotterConfig,
    root: PathBuf,
    store: MetaStore,
    tracker: Arc<MountTracker>,
    rwlayer: WritableLayerManager,
    differ: TarDiffer,
    fsmeta: Arc<FsmetaBuilder>,
    planner: MountPlanner,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

impl ErofsSnapshotter {
    pub fn new(config: SnapshotterConfig) -> Result<ErofsSnapshotter> {
        let root = config.root.clone();
        std::fs::create_dir_all(root.join("snapshots"))?;
        let store = MetaStore::open(&root.join("meta.db"))?;
        let tracker = Arc::new(MountTracker::new());
        let rwlayer = WritableLayerManager::new(config.rwlayer_size, Arc::clone(&tracker));
        let differ = TarDiffer::new(DifferConfig {
            mkfs_options: config.mkfs_options.clone(),
            tar_index_mode: config.tar_index_mode,
        });
        let fsmeta = Arc::new(FsmetaBuilder::new(
            root.clone(),
            config.mkfs_options.clone(),
            config.fsmeta_wait(),
        ));
        info!("snapshotter ready at {}", root.display());
        Ok(ErofsSnapshotter {
            config,
            root,
            store,
            tracker,
            rwlayer,
            differ,
            fsmeta,
            planner: MountPlanner::new(),
            retry: RetryConfig::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn planner(&self) -> &MountPlanner {
        &self.planner
    }

    pub fn fsmeta_builder(&self) -> &FsmetaBuilder {
        &self.fsmeta
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id)
    }

    fn op_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancels in-flight work, unmounts everything this engine mounted and
    /// flushes the store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cleanup = CancellationToken::new();
        for id in self.tracker.get_all_mounted() {
            if self.tracker.needs_cleanup(&id) {
                let dir = self.snapshot_dir(&id);
                self.rwlayer.teardown(&id, &dir, false, &cleanup).await;
            }
        }
        if let Err(err) = self.store.flush() {
            warn!("final store flush failed: {err}");
        }
    }

    /// Resolves the blob of every chain entry starting at `tip_key`.
    /// Returns the records (tip first) and the blob paths newest-first.
    async fn resolve_chain(
        &self,
        tip_key: &str,
        token: &CancellationToken,
    ) -> Result<(Vec<SnapshotRecord>, LayerSequence)> {
        if tip_key.is_empty() {
            return Ok((
                Vec::new(),
                LayerSequence::new_newest_first(Vec::<String>::new()),
            ));
        }
        let records = self.store.chain(tip_key)?;
        let mut blobs = Vec::with_capacity(records.len());
        for record in &records {
            let path = resolve_layer_blob(&self.root, &record.id, &self.retry, token).await?;
            blobs.push(path.to_string_lossy().into_owned());
        }
        Ok((records, LayerSequence::new_newest_first(blobs)))
    }

    /// Existing, completed fsmeta for a tip, if any.
    fn existing_fsmeta(&self, tip_id: &str) -> Option<PathBuf> {
        let path = fsmeta_path(&self.root, tip_id);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    /// Builds (or joins) the fsmeta for a tip and refreshes the descriptor
    /// files beside it.
    async fn ensure_fsmeta_for_tip(
        &self,
        records: &[SnapshotRecord],
        blobs: &LayerSequence,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        let tip = records.first().ok_or_else(|| {
            SnapshotterError::InvalidState("fsmeta requested for empty chain".into())
        })?;
        let path = self.fsmeta.ensure_fsmeta(&tip.id, blobs, token).await?;
        write_tip_descriptors(&self.snapshot_dir(&tip.id), &path, blobs, records);
        Ok(path)
    }

    async fn prepare_impl(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        let token = self.op_token();
        let id = self.store.next_id()?;
        let dir = self.snapshot_dir(&id);
        std::fs::create_dir_all(&dir)?;

        let record = SnapshotRecord::new(key.clone(), id.clone(), Kind::Active, parent.clone(), labels);
        let extract = is_extract_snapshot(&key, &record.labels);
        if let Err(err) = self.store.create(&record) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(err);
        }

        let result = self.prepare_mounts(&record, extract, &dir, &token).await;
        match result {
            Ok(mounts) => Ok(mounts),
            Err(err) => {
                // Unwind everything this Prepare materialised.
                self.rwlayer.teardown(&id, &dir, true, &CancellationToken::new()).await;
                if let Err(remove_err) = self.store.remove(&key) {
                    warn!("unwind of {key} could not remove record: {remove_err}");
                }
                let _ = std::fs::remove_dir_all(&dir);
                Err(err)
            }
        }
    }

    async fn prepare_mounts(
        &self,
        record: &SnapshotRecord,
        extract: bool,
        dir: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<Mount>> {
        if extract {
            return if self.rwlayer.configured() {
                let rw = self.rwlayer.setup(&record.id, dir, token).await?;
                Ok(self.planner.plan_extract(&rw.mountpoint.join("upper")))
            } else {
                let upper = dir.join("fs");
                std::fs::create_dir_all(&upper)?;
                std::fs::create_dir_all(dir.join("work"))?;
                Ok(self.planner.plan_extract(&upper))
            };
        }

        let (records, blobs) = self.resolve_chain(&record.parent, token).await?;
        let fsmeta = records.first().and_then(|tip| self.existing_fsmeta(&tip.id));

        if self.rwlayer.configured() {
            let image = self.rwlayer.prepare_image(dir).await?;
            let mountpoint = WritableLayerManager::mountpoint(dir);
            self.planner.plan_active(
                &blobs,
                fsmeta.as_deref(),
                ActiveUpper::Block {
                    image: &image,
                    mountpoint: &mountpoint,
                },
            )
        } else {
            let upper = dir.join("fs");
            let work = dir.join("work");
            std::fs::create_dir_all(&upper)?;
            std::fs::create_dir_all(&work)?;
            self.planner.plan_active(
                &blobs,
                fsmeta.as_deref(),
                ActiveUpper::Directory {
                    upper: &upper,
                    work: &work,
                },
            )
        }
    }

    async fn view_impl(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        if parent.is_empty() {
            return Err(SnapshotterError::InvalidState(
                "view requires a committed parent".into(),
            ));
        }
        let token = self.op_token();
        let id = self.store.next_id()?;
        let dir = self.snapshot_dir(&id);
        std::fs::create_dir_all(&dir)?;

        let mut record = SnapshotRecord::new(key.clone(), id, Kind::View, parent.clone(), labels);
        // A view has no blob of its own; it presents the parent's.
        record.blob = self.store.stat(&parent)?.blob.clone();
        if let Err(err) = self.store.create(&record) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(err);
        }

        match self.view_mounts(&parent, &token).await {
            Ok(mounts) => Ok(mounts),
            Err(err) => {
                if let Err(remove_err) = self.store.remove(&key) {
                    warn!("unwind of view {key} could not remove record: {remove_err}");
                }
                let _ = std::fs::remove_dir_all(&dir);
                Err(err)
            }
        }
    }

    async fn view_mounts(&self, parent: &str, token: &CancellationToken) -> Result<Vec<Mount>> {
        let (records, blobs) = self.resolve_chain(parent, token).await?;

        let fsmeta = if blobs.len() > 1 {
            match self.ensure_fsmeta_for_tip(&records, &blobs, token).await {
                Ok(path) => Some(path),
                // Mixed block sizes can never compose into one device table;
                // per-layer lowers still work. Anything else surfaces.
                Err(err @ SnapshotterError::IncompatibleBlockSize { .. }) => {
                    warn!("falling back to overlay for {parent}: {err}");
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        self.planner.plan_committed_view(&blobs, fsmeta.as_deref())
    }

    async fn commit_impl(
        &self,
        name: String,
        key: String,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let token = self.op_token();
        let record = self.store.stat(&key)?;
        if record.kind != Kind::Active {
            return Err(SnapshotterError::InvalidState(format!(
                "cannot commit {key}: snapshot is not active"
            )));
        }
        let id = record.id.clone();
        let dir = self.snapshot_dir(&id);

        let blob = self.materialize_blob(&record, &dir, &token).await?;
        let committed = self.store.commit(&key, &name, blob, labels)?;
        debug!("committed {key} as {name} (id {id})");

        // The writable layer has served its purpose.
        self.rwlayer.teardown(&id, &dir, true, &token).await;

        self.maybe_schedule_fsmeta_rebuild(&committed);
        Ok(())
    }

    /// Produces the committed blob for an active snapshot: reuse what the
    /// differ already wrote, otherwise convert the upper directory.
    async fn materialize_blob(
        &self,
        record: &SnapshotRecord,
        dir: &Path,
        token: &CancellationToken,
    ) -> Result<BlobRef> {
        if let Ok(existing) = find_layer_blob(&self.root, &record.id) {
            let digest = digest_file(&existing)?;
            let size = std::fs::metadata(&existing)?.len();
            return Ok(BlobRef {
                path: existing,
                digest,
                size,
            });
        }

        let upper = if self.rwlayer.configured() {
            // Host-mount the block image (idempotent when the extract path
            // already mounted it) so the upper contents are readable.
            let rw = self.rwlayer.setup(&record.id, dir, token).await?;
            self.rwlayer.sync(&record.id).await;
            rw.mountpoint.join("upper")
        } else {
            dir.join("fs")
        };
        if !upper.is_dir() {
            std::fs::create_dir_all(&upper)?;
        }

        let output = dir.join(LAYER_BLOB_NAME);
        self.differ
            .convert_upper_dir(&record.id, &upper, &output, token)
            .await
    }

    /// Once a chain outgrows the configured threshold, rebuild the tip's
    /// fsmeta in the background so the next View finds the descriptor ready
    /// instead of building it inline.
    fn maybe_schedule_fsmeta_rebuild(&self, committed: &SnapshotRecord) {
        if self.config.max_unmerged_layers == 0 {
            return;
        }
        let chain = match self.store.chain(&committed.key) {
            Ok(chain) => chain,
            Err(err) => {
                warn!("cannot walk chain of {}: {err}", committed.key);
                return;
            }
        };
        if chain.len() <= self.config.max_unmerged_layers {
            return;
        }

        let blobs: Vec<String> = chain
            .iter()
            .filter_map(|rec| rec.blob.as_ref())
            .map(|blob| blob.path.to_string_lossy().into_owned())
            .collect();
        if blobs.len() != chain.len() {
            warn!(
                "chain of {} has committed entries without blobs, skipping fsmeta rebuild",
                committed.key
            );
            return;
        }

        let builder = Arc::clone(&self.fsmeta);
        let tip_dir = self.snapshot_dir(&committed.id);
        let tip_id = committed.id.clone();
        let records = chain;
        let sequence = LayerSequence::new_newest_first(blobs);
        let token = self.shutdown.child_token();
        debug!(
            "scheduling background fsmeta rebuild for {tip_id} ({} layers)",
            sequence.len()
        );
        tokio::spawn(async move {
            match builder.ensure_fsmeta(&tip_id, &sequence, &token).await {
                Ok(path) => write_tip_descriptors(&tip_dir, &path, &sequence, &records),
                Err(err) => warn!("background fsmeta rebuild for {tip_id} failed: {err}"),
            }
        });
    }

    async fn remove_impl(&self, key: String) -> Result<()> {
        // The store refuses atomically while children exist; a refusal has
        // no side effects.
        let record = self.store.remove(&key)?;
        let dir = self.snapshot_dir(&record.id);

        if record.kind == Kind::Active {
            let token = CancellationToken::new();
            self.rwlayer.teardown(&record.id, &dir, true, &token).await;
        }
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("remove of {key} left {} behind: {err}", dir.display());
            }
        }
        Ok(())
    }

    async fn mounts_impl(&self, key: String) -> Result<Vec<Mount>> {
        let token = self.op_token();
        let record = self.store.stat(&key)?;
        match record.kind {
            Kind::View => self.view_mounts(&record.parent, &token).await,
            Kind::Active => {
                let dir = self.snapshot_dir(&record.id);
                let extract = is_extract_snapshot(&record.key, &record.labels);
                if extract {
                    let upper = if self.tracker.is_mounted(&record.id) {
                        WritableLayerManager::mountpoint(&dir).join("upper")
                    } else {
                        dir.join("fs")
                    };
                    return Ok(self.planner.plan_extract(&upper));
                }

                let (records, blobs) = self.resolve_chain(&record.parent, &token).await?;
                let fsmeta = records.first().and_then(|tip| self.existing_fsmeta(&tip.id));
                let image = WritableLayerManager::image_path(&dir);
                if image.is_file() {
                    let mountpoint = WritableLayerManager::mountpoint(&dir);
                    self.planner.plan_active(
                        &blobs,
                        fsmeta.as_deref(),
                        ActiveUpper::Block {
                            image: &image,
                            mountpoint: &mountpoint,
                        },
                    )
                } else {
                    self.planner.plan_active(
                        &blobs,
                        fsmeta.as_deref(),
                        ActiveUpper::Directory {
                            upper: &dir.join("fs"),
                            work: &dir.join("work"),
                        },
                    )
                }
            }
            _ => Err(SnapshotterError::InvalidState(format!(
                "snapshot {key} is neither active nor a view"
            ))),
        }
    }

    async fn usage_impl(&self, key: String) -> Result<Usage> {
        let record = self.store.stat(&key)?;
        if record.kind != Kind::Committed {
            // Only committed snapshots consume accounted storage.
            return Ok(Usage { inodes: 0, size: 0 });
        }
        let size = match &record.blob {
            Some(blob) => std::fs::metadata(&blob.path)
                .map(|m| m.len())
                .unwrap_or(blob.size),
            None => find_layer_blob(&self.root, &record.id)
                .and_then(|p| Ok(std::fs::metadata(p)?.len()))
                .unwrap_or(0),
        };
        Ok(Usage {
            inodes: 1,
            size: size as i64,
        })
    }

    fn update_impl(&self, info: Info, fieldpaths: Option<Vec<String>>) -> Result<Info> {
        if let Some(paths) = &fieldpaths {
            for path in paths {
                if path != "labels" && !path.starts_with("labels.") {
                    return Err(SnapshotterError::InvalidState(format!(
                        "only labels may be updated, rejected field path {path}"
                    )));
                }
            }
        }

        let record = self.store.update(&info.name, |rec| match &fieldpaths {
            Some(paths) if !paths.is_empty() => {
                for path in paths {
                    if path == "labels" {
                        rec.labels = info.labels.clone();
                    } else if let Some(label) = path.strip_prefix("labels.") {
                        match info.labels.get(label) {
                            Some(value) => {
                                rec.labels.insert(label.to_string(), value.clone());
                            }
                            None => {
                                rec.labels.remove(label);
                            }
                        }
                    }
                }
            }
            _ => rec.labels = info.labels.clone(),
        })?;
        Ok(record_to_info(&record))
    }

    /// Differ Apply surface: stream a tar layer into the extract target
    /// described by `mounts` and return the produced blob descriptor.
    pub async fn apply<R>(&self, mounts: &[Mount], input: R) -> Result<BlobRef>
    where
        R: Read + Send + 'static,
    {
        let token = self.op_token();
        self.differ.apply(&self.root, mounts, input, &token).await
    }

    /// Differ Compare surface: the diff of an extract snapshot is its
    /// already-converted blob.
    pub async fn compare(&self, _lower: &[Mount], upper: &[Mount]) -> Result<BlobRef> {
        self.differ.compare(&self.root, upper).await
    }
}

/// Best-effort refresh of `merged.vmdk` and `layers.manifest` beside a
/// freshly built fsmeta.
fn write_tip_descriptors(
    tip_dir: &Path,
    fsmeta: &Path,
    blobs: &LayerSequence,
    records: &[SnapshotRecord],
) {
    if let Err(err) = vmdk::write_vmdk(tip_dir, fsmeta, blobs) {
        warn!("writing merged.vmdk in {} failed: {err}", tip_dir.display());
    }
    let digests: Vec<String> = records
        .iter()
        .filter_map(|rec| rec.blob.as_ref())
        .map(|blob| blob.digest.clone())
        .collect();
    if digests.len() == records.len() {
        if let Err(err) = vmdk::write_layers_manifest(tip_dir, &digests) {
            warn!(
                "writing layers.manifest in {} failed: {err}",
                tip_dir.display()
            );
        }
    }
}

#[tonic::async_trait]
impl Snapshotter for ErofsSnapshotter {
    type Error = Status;

    async fn stat(&self, key: String) -> std::result::Result<Info, Self::Error> {
        debug!("stat({key})");
        let record = self.store.stat(&key).map_err(|err| {
            debug!("stat({key}) failed: {err}");
            Status::from(err)
        })?;
        Ok(record_to_info(&record))
    }

    async fn update(
        &self,
        info: Info,
        fieldpaths: Option<Vec<String>>,
    ) -> std::result::Result<Info, Self::Error> {
        info!("update({}, {fieldpaths:?})", info.name);
        self.update_impl(info, fieldpaths).map_err(|err| {
            error!("update() failed: {err}");
            Status::from(err)
        })
    }

    async fn usage(&self, key: String) -> std::result::Result<Usage, Self::Error> {
        debug!("usage({key})");
        self.usage_impl(key).await.map_err(|err| {
            error!("usage() failed: {err}");
            Status::from(err)
        })
    }

    async fn mounts(&self, key: String) -> std::result::Result<Vec<Mount>, Self::Error> {
        debug!("mounts({key})");
        self.mounts_impl(key).await.map_err(|err| {
            error!("mounts() failed: {err}");
            Status::from(err)
        })
    }

    async fn prepare(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<Mount>, Self::Error> {
        info!("prepare({key}, {parent})");
        self.prepare_impl(key, parent, labels).await.map_err(|err| {
            error!("prepare() failed: {err}");
            Status::from(err)
        })
    }

    async fn view(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<Mount>, Self::Error> {
        info!("view({key}, {parent})");
        self.view_impl(key, parent, labels).await.map_err(|err| {
            error!("view() failed: {err}");
            Status::from(err)
        })
    }

    async fn commit(
        &self,
        name: String,
        key: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<(), Self::Error> {
        info!("commit({name}, {key})");
        self.commit_impl(name, key, labels).await.map_err(|err| {
            error!("commit() failed: {err}");
            Status::from(err)
        })
    }

    async fn remove(&self, key: String) -> std::result::Result<(), Self::Error> {
        info!("remove({key})");
        self.remove_impl(key).await.map_err(|err| {
            error!("remove() failed: {err}");
            Status::from(err)
        })
    }

    type InfoStream =
        Pin<Box<dyn tokio_stream::Stream<Item = std::result::Result<Info, Self::Error>> + Send + 'static>>;

    async fn list(&self) -> std::result::Result<Self::InfoStream, Self::Error> {
        debug!("list()");
        let mut infos = Vec::new();
        self.store
            .walk(|record| {
                infos.push(record_to_info(record));
                ControlFlow::Continue(())
            })
            .map_err(Status::from)?;
        Ok(Box::pin(tokio_stream::iter(
            infos.into_iter().map(Ok::<Info, Status>),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_key_detection() {
        assert!(is_extract_key("default/1/extract-12345"));
        assert!(is_extract_key("default/1/extract-sha256:abc123"));
        assert!(is_extract_key("extract-12345"));
        assert!(is_extract_key("extract-"));
        assert!(is_extract_key("default/1/extract"));
        assert!(is_extract_key("ns/a/b/c/extract-12345"));

        assert!(!is_extract_key("default/1/other-12345"));
        assert!(!is_extract_key(""));
        assert!(!is_extract_key("default/extract-123/snapshot"));
    }

    #[test]
    fn extract_label_detection() {
        let mut labels = HashMap::new();
        assert!(!is_extract_snapshot("default/1/other", &labels));

        labels.insert(EXTRACT_SNAPSHOT_LABEL.to_string(), "true".to_string());
        assert!(is_extract_snapshot("default/1/other", &labels));

        labels.insert(EXTRACT_SNAPSHOT_LABEL.to_string(), "false".to_string());
        assert!(!is_extract_snapshot("default/1/other", &labels));

        labels.insert(EXTRACT_SNAPSHOT_LABEL.to_string(), String::new());
        assert!(!is_extract_snapshot("default/1/other", &labels));

        // The key prefix alone is enough.
        labels.clear();
        assert!(is_extract_snapshot("default/1/extract-1", &labels));
    }

    #[test]
    fn info_conversion_carries_identity() {
        let record = SnapshotRecord::new(
            "ns/1/key".into(),
            "17".into(),
            Kind::Committed,
            "ns/1/parent".into(),
            HashMap::from([("a".to_string(), "b".to_string())]),
        );
        let info = record_to_info(&record);
        assert_eq!(info.name, "ns/1/key");
        assert_eq!(info.parent, "ns/1/parent");
        assert_eq!(info.kind, Kind::Committed);
        assert_eq!(info.labels.get("a").map(String::as_str), Some("b"));
    }
}
