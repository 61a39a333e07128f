//! Persistent snapshot metadata.
//!
//! A single sled database under `root/meta.db` holds every snapshot record
//! plus the secondary indices used to enforce the store-level invariants:
//!
//!   - `snapshots` tree: key -> JSON-encoded [`SnapshotRecord`]
//!   - `indices` tree, prefixed entries:
//!       - `by-kind/<kind>/<key>`   membership marker per kind
//!       - `by-parent/<parent>`    child count, for refusing removal
//!       - `active-parent/<parent>` the single active child, for the
//!         one-active-per-parent rule
//!
//! Mutations run inside sled transactions spanning both trees, so a record
//! and its index entries change atomically; the database is flushed before
//! any write returns. Readers run concurrently with the single writer.

use chrono::{DateTime, Utc};
use containerd_snapshots::Kind;
use log::debug;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotterError};
use crate::layer_order::LayerSequence;

const SCHEMA_VERSION: &[u8] = b"1";
const SCHEMA_KEY: &[u8] = b"schema-version";

/// Descriptor of the EROFS blob produced for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
}

/// One persisted snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Caller-supplied opaque key, unique across all kinds.
    pub key: String,
    /// Internal stable identifier; names the on-disk directory.
    pub id: String,
    pub kind: Kind,
    /// Parent key; empty for a root snapshot.
    pub parent: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    /// Set for every committed snapshot; optional while active.
    pub blob: Option<BlobRef>,
}

impl Clone for SnapshotRecord {
    fn clone(&self) -> Self {
        SnapshotRecord {
            key: self.key.clone(),
            id: self.id.clone(),
            kind: kind_copy(&self.kind),
            parent: self.parent.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            labels: self.labels.clone(),
            blob: self.blob.clone(),
        }
    }
}

impl SnapshotRecord {
    pub fn new(
        key: String,
        id: String,
        kind: Kind,
        parent: String,
        labels: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        SnapshotRecord {
            key,
            id,
            kind,
            parent,
            created_at: now,
            updated_at: now,
            labels,
            blob: None,
        }
    }
}

pub(crate) fn kind_copy(kind: &Kind) -> Kind {
    match kind {
        Kind::Unknown => Kind::Unknown,
        Kind::View => Kind::View,
        Kind::Active => Kind::Active,
        Kind::Committed => Kind::Committed,
    }
}

fn kind_str(kind: Kind) -> &'static str {
    match kind {
        Kind::View => "view",
        Kind::Active => "active",
        Kind::Committed => "committed",
        _ => "unknown",
    }
}

fn by_kind_key(kind: Kind, key: &str) -> Vec<u8> {
    format!("by-kind/{}/{key}", kind_str(kind)).into_bytes()
}

fn child_count_key(parent: &str) -> Vec<u8> {
    format!("by-parent/{parent}").into_bytes()
}

fn active_parent_key(parent: &str) -> Vec<u8> {
    format!("active-parent/{parent}").into_bytes()
}

fn decode_count(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = raw.len().min(8);
    buf[8 - n..].copy_from_slice(&raw[..n]);
    u64::from_be_bytes(buf)
}

type Abortable<T> = std::result::Result<T, ConflictableTransactionError<SnapshotterError>>;

fn abort<T>(err: SnapshotterError) -> Abortable<T> {
    Err(ConflictableTransactionError::Abort(err))
}

/// The metadata store.
pub struct MetaStore {
    db: sled::Db,
    snapshots: sled::Tree,
    indices: sled::Tree,
}

impl MetaStore {
    /// Opens (or creates) the store. An existing database with a different
    /// schema version is rejected rather than migrated.
    pub fn open(path: &Path) -> Result<MetaStore> {
        let db = sled::open(path)?;
        match db.get(SCHEMA_KEY)? {
            Some(found) if found.as_ref() != SCHEMA_VERSION => {
                return Err(SnapshotterError::InvalidState(format!(
                    "metadata store at {} has schema version {:?}, expected {:?}",
                    path.display(),
                    String::from_utf8_lossy(&found),
                    String::from_utf8_lossy(SCHEMA_VERSION),
                )));
            }
            Some(_) => {}
            None => {
                db.insert(SCHEMA_KEY, SCHEMA_VERSION)?;
                db.flush()?;
            }
        }
        let snapshots = db.open_tree("snapshots")?;
        let indices = db.open_tree("indices")?;
        debug!("metadata store open at {}", path.display());
        Ok(MetaStore {
            db,
            snapshots,
            indices,
        })
    }

    /// Allocates a fresh internal snapshot id.
    pub fn next_id(&self) -> Result<String> {
        Ok(self.db.generate_id()?.to_string())
    }

    /// Inserts a new record, enforcing key uniqueness, the committed-parent
    /// requirement and the one-active-per-parent rule, all atomically.
    pub fn create(&self, record: &SnapshotRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;

        let result = (&self.snapshots, &self.indices).transaction(|(snaps, idx)| {
            if snaps.get(record.key.as_bytes())?.is_some() {
                return abort(SnapshotterError::AlreadyExists(record.key.clone()));
            }

            if !record.parent.is_empty() {
                let parent_raw = match snaps.get(record.parent.as_bytes())? {
                    Some(raw) => raw,
                    None => return abort(SnapshotterError::NotFound(record.parent.clone())),
                };
                let parent: SnapshotRecord = match serde_json::from_slice(&parent_raw) {
                    Ok(rec) => rec,
                    Err(err) => return abort(SnapshotterError::Serde(err)),
                };
                if parent.kind != Kind::Committed {
                    return abort(SnapshotterError::InvalidState(format!(
                        "parent {} is {}, not committed",
                        record.parent,
                        kind_str(kind_copy(&parent.kind))
                    )));
                }

                if record.kind == Kind::Active {
                    let akey = active_parent_key(&record.parent);
                    if let Some(existing) = idx.get(akey.clone())? {
                        return abort(SnapshotterError::InvalidState(format!(
                            "parent {} already has active child {}",
                            record.parent,
                            String::from_utf8_lossy(&existing)
                        )));
                    }
                    idx.insert(akey, record.key.as_bytes())?;
                }

                let ckey = child_count_key(&record.parent);
                let count = idx.get(ckey.clone())?.map(|v| decode_count(&v)).unwrap_or(0);
                idx.insert(ckey, &(count + 1).to_be_bytes()[..])?;
            }

            idx.insert(by_kind_key(kind_copy(&record.kind), &record.key), &b""[..])?;
            snaps.insert(record.key.as_bytes(), payload.as_slice())?;
            Ok(())
        });
        self.finish_write(result)
    }

    /// Looks up a record by key.
    pub fn stat(&self, key: &str) -> Result<SnapshotRecord> {
        match self.snapshots.get(key.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(SnapshotterError::NotFound(key.to_string())),
        }
    }

    /// Applies `mutator` to the current record and persists the result.
    /// The kind of a committed snapshot cannot change; `updated_at` is
    /// refreshed automatically.
    pub fn update<F>(&self, key: &str, mutator: F) -> Result<SnapshotRecord>
    where
        F: Fn(&mut SnapshotRecord),
    {
        let result = (&self.snapshots, &self.indices).transaction(|(snaps, idx)| {
            let raw = match snaps.get(key.as_bytes())? {
                Some(raw) => raw,
                None => return abort(SnapshotterError::NotFound(key.to_string())),
            };
            let old: SnapshotRecord = match serde_json::from_slice(&raw) {
                Ok(rec) => rec,
                Err(err) => return abort(SnapshotterError::Serde(err)),
            };

            let mut updated = old.clone();
            mutator(&mut updated);
            updated.key = old.key.clone();
            updated.id = old.id.clone();
            updated.parent = old.parent.clone();
            updated.created_at = old.created_at;
            updated.updated_at = Utc::now();

            if old.kind == Kind::Committed && updated.kind != Kind::Committed {
                return abort(SnapshotterError::InvalidState(format!(
                    "cannot change kind of committed snapshot {key}"
                )));
            }
            if updated.kind != old.kind {
                idx.remove(by_kind_key(kind_copy(&old.kind), key))?;
                idx.insert(by_kind_key(kind_copy(&updated.kind), key), &b""[..])?;
            }

            let payload = match serde_json::to_vec(&updated) {
                Ok(p) => p,
                Err(err) => return abort(SnapshotterError::Serde(err)),
            };
            snaps.insert(key.as_bytes(), payload)?;
            Ok(updated)
        });
        self.finish_write(result)
    }

    /// Removes a record, refusing while other records name it as parent.
    /// Returns the removed record so callers can clean up its directory.
    pub fn remove(&self, key: &str) -> Result<SnapshotRecord> {
        let result = (&self.snapshots, &self.indices).transaction(|(snaps, idx)| {
            let raw = match snaps.get(key.as_bytes())? {
                Some(raw) => raw,
                None => return abort(SnapshotterError::NotFound(key.to_string())),
            };
            let record: SnapshotRecord = match serde_json::from_slice(&raw) {
                Ok(rec) => rec,
                Err(err) => return abort(SnapshotterError::Serde(err)),
            };

            let own_children = child_count_key(key);
            let children = idx.get(own_children)?.map(|v| decode_count(&v)).unwrap_or(0);
            if children > 0 {
                return abort(SnapshotterError::InvalidState(format!(
                    "snapshot {key} has {children} child snapshot(s)"
                )));
            }

            if !record.parent.is_empty() {
                let ckey = child_count_key(&record.parent);
                let count = idx.get(ckey.clone())?.map(|v| decode_count(&v)).unwrap_or(0);
                if count <= 1 {
                    idx.remove(ckey)?;
                } else {
                    idx.insert(ckey, &(count - 1).to_be_bytes()[..])?;
                }

                if record.kind == Kind::Active {
                    let akey = active_parent_key(&record.parent);
                    if let Some(existing) = idx.get(akey.clone())? {
                        if existing.as_ref() == key.as_bytes() {
                            idx.remove(akey)?;
                        }
                    }
                }
            }

            idx.remove(by_kind_key(kind_copy(&record.kind), key))?;
            snaps.remove(key.as_bytes())?;
            Ok(record)
        });
        self.finish_write(result)
    }

    /// Promotes an active record to a committed one under a new key, in one
    /// transaction: the old key disappears, the new key carries the same id
    /// and parent plus the blob provenance.
    pub fn commit(
        &self,
        active_key: &str,
        committed_key: &str,
        blob: BlobRef,
        labels: HashMap<String, String>,
    ) -> Result<SnapshotRecord> {
        let result = (&self.snapshots, &self.indices).transaction(|(snaps, idx)| {
            if snaps.get(committed_key.as_bytes())?.is_some() {
                return abort(SnapshotterError::AlreadyExists(committed_key.to_string()));
            }
            let raw = match snaps.get(active_key.as_bytes())? {
                Some(raw) => raw,
                None => return abort(SnapshotterError::NotFound(active_key.to_string())),
            };
            let active: SnapshotRecord = match serde_json::from_slice(&raw) {
                Ok(rec) => rec,
                Err(err) => return abort(SnapshotterError::Serde(err)),
            };
            if active.kind != Kind::Active {
                return abort(SnapshotterError::InvalidState(format!(
                    "snapshot {active_key} is {}, not active",
                    kind_str(kind_copy(&active.kind))
                )));
            }

            let mut committed = active.clone();
            committed.key = committed_key.to_string();
            committed.kind = Kind::Committed;
            committed.updated_at = Utc::now();
            committed.blob = Some(blob.clone());
            committed.labels.extend(labels.clone());

            if !active.parent.is_empty() {
                let akey = active_parent_key(&active.parent);
                if let Some(existing) = idx.get(akey.clone())? {
                    if existing.as_ref() == active_key.as_bytes() {
                        idx.remove(akey)?;
                    }
                }
            }
            idx.remove(by_kind_key(Kind::Active, active_key))?;
            idx.insert(by_kind_key(Kind::Committed, committed_key), &b""[..])?;

            let payload = match serde_json::to_vec(&committed) {
                Ok(p) => p,
                Err(err) => return abort(SnapshotterError::Serde(err)),
            };
            snaps.remove(active_key.as_bytes())?;
            snaps.insert(committed_key.as_bytes(), payload)?;
            Ok(committed)
        });
        self.finish_write(result)
    }

    /// Iterates all records in key order. `f` returns
    /// `ControlFlow::Break(())` to stop early.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&SnapshotRecord) -> ControlFlow<()>,
    {
        for item in self.snapshots.iter() {
            let (_, raw) = item?;
            let record: SnapshotRecord = serde_json::from_slice(&raw)?;
            if let ControlFlow::Break(()) = f(&record) {
                break;
            }
        }
        Ok(())
    }

    /// Walks the parent chain from `key` and returns the records, tip first.
    pub fn chain(&self, key: &str) -> Result<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut next = key.to_string();
        while !next.is_empty() {
            if !seen.insert(next.clone()) {
                return Err(SnapshotterError::InvalidState(format!(
                    "parent cycle detected at snapshot {next}"
                )));
            }
            let record = self.stat(&next)?;
            next = record.parent.clone();
            records.push(record);
        }
        Ok(records)
    }

    /// The chain of internal ids from `key`, newest first.
    pub fn chain_ids(&self, key: &str) -> Result<LayerSequence> {
        let records = self.chain(key)?;
        Ok(LayerSequence::new_newest_first(
            records.into_iter().map(|r| r.id),
        ))
    }

    /// Flushes outstanding writes; used at shutdown.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn finish_write<T>(
        &self,
        result: std::result::Result<T, TransactionError<SnapshotterError>>,
    ) -> Result<T> {
        let value = match result {
            Ok(value) => value,
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(SnapshotterError::Store(err)),
        };
        self.db.flush()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> MetaStore {
        MetaStore::open(&dir.join("meta.db")).unwrap()
    }

    fn record(store: &MetaStore, key: &str, kind: Kind, parent: &str) -> SnapshotRecord {
        SnapshotRecord::new(
            key.to_string(),
            store.next_id().unwrap(),
            kind,
            parent.to_string(),
            HashMap::new(),
        )
    }

    #[test]
    fn create_and_stat_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let rec = record(&store, "a", Kind::Active, "");
        store.create(&rec).unwrap();

        let got = store.stat("a").unwrap();
        assert_eq!(got.key, "a");
        assert_eq!(got.id, rec.id);
        assert_eq!(got.kind, Kind::Active);
        assert!(got.blob.is_none());
    }

    #[test]
    fn duplicate_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.create(&record(&store, "a", Kind::Active, "")).unwrap();
        let err = store
            .create(&record(&store, "a", Kind::View, ""))
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::AlreadyExists(_)));
    }

    #[test]
    fn parent_must_exist_and_be_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let err = store
            .create(&record(&store, "child", Kind::Active, "ghost"))
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::NotFound(_)));

        store
            .create(&record(&store, "base-active", Kind::Active, ""))
            .unwrap();
        let err = store
            .create(&record(&store, "child", Kind::Active, "base-active"))
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));
    }

    #[test]
    fn one_active_per_nonempty_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .create(&record(&store, "base", Kind::Committed, ""))
            .unwrap();
        store
            .create(&record(&store, "active-1", Kind::Active, "base"))
            .unwrap();
        let err = store
            .create(&record(&store, "active-2", Kind::Active, "base"))
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));

        // Views are not restricted.
        store
            .create(&record(&store, "view-1", Kind::View, "base"))
            .unwrap();
        store
            .create(&record(&store, "view-2", Kind::View, "base"))
            .unwrap();
    }

    #[test]
    fn root_snapshots_are_not_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        for i in 0..10 {
            store
                .create(&record(&store, &format!("root-{i}"), Kind::Active, ""))
                .unwrap();
        }
    }

    #[test]
    fn remove_refused_while_children_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .create(&record(&store, "base", Kind::Committed, ""))
            .unwrap();
        store
            .create(&record(&store, "child", Kind::View, "base"))
            .unwrap();

        let err = store.remove("base").unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));
        // The refusal has no side effects.
        assert!(store.stat("base").is_ok());
        assert!(store.stat("child").is_ok());

        store.remove("child").unwrap();
        store.remove("base").unwrap();
        assert!(matches!(
            store.stat("base"),
            Err(SnapshotterError::NotFound(_))
        ));
    }

    #[test]
    fn double_remove_is_cleanly_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.create(&record(&store, "a", Kind::Active, "")).unwrap();
        store.remove("a").unwrap();
        assert!(matches!(
            store.remove("a"),
            Err(SnapshotterError::NotFound(_))
        ));
    }

    #[test]
    fn removing_active_frees_the_parent_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .create(&record(&store, "base", Kind::Committed, ""))
            .unwrap();
        store
            .create(&record(&store, "active-1", Kind::Active, "base"))
            .unwrap();
        store.remove("active-1").unwrap();
        store
            .create(&record(&store, "active-2", Kind::Active, "base"))
            .unwrap();
    }

    #[test]
    fn commit_promotes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let active = record(&store, "extract-a", Kind::Active, "");
        store.create(&active).unwrap();

        let blob = BlobRef {
            path: "/root/snapshots/1/layer.erofs".into(),
            digest: "sha256:abc".into(),
            size: 4096,
        };
        let committed = store
            .commit("extract-a", "committed-a", blob.clone(), HashMap::new())
            .unwrap();

        assert_eq!(committed.kind, Kind::Committed);
        assert_eq!(committed.id, active.id);
        assert_eq!(committed.blob, Some(blob));
        assert!(matches!(
            store.stat("extract-a"),
            Err(SnapshotterError::NotFound(_))
        ));

        // The freed parent slot accepts a new active child chain.
        store
            .create(&record(&store, "extract-b", Kind::Active, "committed-a"))
            .unwrap();
    }

    #[test]
    fn commit_requires_active_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .create(&record(&store, "base", Kind::Committed, ""))
            .unwrap();
        store
            .create(&record(&store, "v", Kind::View, "base"))
            .unwrap();
        let blob = BlobRef {
            path: "/x".into(),
            digest: "sha256:x".into(),
            size: 0,
        };
        let err = store
            .commit("v", "nope", blob, HashMap::new())
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));
    }

    #[test]
    fn chain_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let a = record(&store, "committed-a", Kind::Committed, "");
        store.create(&a).unwrap();
        let b = record(&store, "committed-b", Kind::Committed, "committed-a");
        store.create(&b).unwrap();

        let chain = store.chain_ids("committed-b").unwrap();
        assert_eq!(chain.ids(), [b.id.clone(), a.id.clone()]);

        let records = store.chain("committed-b").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "committed-b");
        assert_eq!(records[1].key, "committed-a");
    }

    #[test]
    fn walk_is_key_ordered_and_stoppable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        for key in ["c", "a", "b"] {
            store.create(&record(&store, key, Kind::Active, "")).unwrap();
        }

        let mut keys = Vec::new();
        store
            .walk(|rec| {
                keys.push(rec.key.clone());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(keys, ["a", "b", "c"]);

        let mut count = 0;
        store
            .walk(|_| {
                count += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn update_changes_labels_but_not_committed_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .create(&record(&store, "base", Kind::Committed, ""))
            .unwrap();

        let updated = store
            .update("base", |rec| {
                rec.labels.insert("note".into(), "hello".into());
            })
            .unwrap();
        assert_eq!(updated.labels.get("note").map(String::as_str), Some("hello"));

        let err = store
            .update("base", |rec| {
                rec.kind = Kind::Active;
            })
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store
                .create(&record(&store, "persistent", Kind::Committed, ""))
                .unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.stat("persistent").unwrap().kind, Kind::Committed);
    }

    #[test]
    fn incompatible_schema_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        {
            let db = sled::open(&path).unwrap();
            db.insert(SCHEMA_KEY, &b"999"[..]).unwrap();
            db.flush().unwrap();
        }
        let err = MetaStore::open(&path).unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidState(_)));
    }
}
