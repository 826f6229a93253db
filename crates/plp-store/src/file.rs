//! Filesystem repository backend.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/ids.json            id counters
//! <root>/store.lock          cross-process write lock
//! <root>/batches/<id>.json   one document per batch (batch + its items)
//! ```
//!
//! Reads go straight to the documents, which are replaced by rename. Every
//! write holds `store.lock`, so id allocation, the duplicate-order scan and
//! the version check see one writer at a time across processes.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use plp_types::{Batch, BatchId, BatchStatus, ItemId, ItemRecord, ItemStatus, StatusField};
use serde::{Deserialize, Serialize};

use crate::{BatchRepository, ItemRepository, Result, StoreError, matches_filter};

const IDS_FILE: &str = "ids.json";
const BATCHES_DIR: &str = "batches";
const WRITE_LOCK_FILE: &str = "store.lock";
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(10);
const WRITE_LOCK_POLL: Duration = Duration::from_millis(10);
/// A write lock untouched for this long belongs to a dead writer.
const WRITE_LOCK_STALE: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdCounters {
    last_batch_id: BatchId,
    last_item_id: ItemId,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchDocument {
    batch: Batch,
    #[serde(default)]
    items: Vec<ItemRecord>,
}

/// JSON-file store rooted at a state directory.
///
/// Read-modify-write cycles are serialized by an in-process mutex and, for
/// writes, by the `store.lock` file shared with other processes.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    guard: Mutex<()>,
    lock_wait: Duration,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: Mutex::new(()),
            lock_wait: WRITE_LOCK_WAIT,
        }
    }

    /// How long a write waits for another process before failing with
    /// [`StoreError::Busy`].
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.guard.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// In-process guard plus the cross-process write lock.
    fn write_lock(&self) -> Result<(MutexGuard<'_, ()>, WriteLock)> {
        let guard = self.lock()?;
        let lock = WriteLock::acquire(&self.root, self.lock_wait)?;
        Ok((guard, lock))
    }

    fn batches_dir(&self) -> PathBuf {
        self.root.join(BATCHES_DIR)
    }

    fn batch_path(&self, id: BatchId) -> PathBuf {
        self.batches_dir().join(format!("{id}.json"))
    }

    fn load_counters(&self) -> Result<IdCounters> {
        Ok(read_json(&self.root.join(IDS_FILE))?.unwrap_or_default())
    }

    fn save_counters(&self, counters: &IdCounters) -> Result<()> {
        atomic_write_json(&self.root.join(IDS_FILE), counters)
    }

    fn load_document(&self, id: BatchId) -> Result<Option<BatchDocument>> {
        read_json(&self.batch_path(id))
    }

    fn save_document(&self, doc: &BatchDocument) -> Result<()> {
        atomic_write_json(&self.batch_path(doc.batch.id), doc)
    }

    /// Every batch document, ordered by batch id.
    fn all_documents(&self) -> Result<Vec<BatchDocument>> {
        let dir = self.batches_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<BatchId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.load_document(id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn require_document(&self, id: BatchId) -> Result<BatchDocument> {
        self.load_document(id)?.ok_or(StoreError::BatchNotFound(id))
    }
}

impl BatchRepository for FileStore {
    fn insert_batch(&self, scope_id: &str) -> Result<Batch> {
        let _locks = self.write_lock()?;
        let mut counters = self.load_counters()?;
        counters.last_batch_id += 1;
        // Never reuse the id of a document the counters do not know about.
        while self.batch_path(counters.last_batch_id).exists() {
            counters.last_batch_id += 1;
        }

        let mut batch = Batch::new(counters.last_batch_id, scope_id);
        batch.version = 1;
        let doc = BatchDocument {
            batch,
            items: Vec::new(),
        };
        self.save_counters(&counters)?;
        self.save_document(&doc)?;
        Ok(doc.batch)
    }

    fn load_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let _guard = self.lock()?;
        Ok(self.load_document(id)?.map(|doc| doc.batch))
    }

    fn save_batch(&self, batch: &mut Batch) -> Result<()> {
        let _locks = self.write_lock()?;
        let mut doc = self.require_document(batch.id)?;
        if doc.batch.version != batch.version {
            return Err(StoreError::Conflict {
                batch_id: batch.id,
                expected: batch.version,
                found: doc.batch.version,
            });
        }
        batch.version += 1;
        batch.updated_at = Utc::now();
        doc.batch = batch.clone();
        self.save_document(&doc)
    }

    fn batches_by_status(&self, statuses: &[BatchStatus]) -> Result<Vec<Batch>> {
        let _guard = self.lock()?;
        Ok(self
            .all_documents()?
            .into_iter()
            .map(|doc| doc.batch)
            .filter(|b| statuses.contains(&b.status))
            .collect())
    }

    fn delete_batch(&self, id: BatchId) -> Result<()> {
        let _locks = self.write_lock()?;
        let path = self.batch_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                fsync_parent_dir(&path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::BatchNotFound(id)),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

impl ItemRepository for FileStore {
    fn insert_item(&self, batch_id: BatchId, order_ref: &str) -> Result<ItemRecord> {
        let _locks = self.write_lock()?;
        let docs = self.all_documents()?;
        if let Some(doc) = docs
            .iter()
            .find(|doc| doc.items.iter().any(|i| i.order_ref == order_ref))
        {
            return Err(StoreError::DuplicateOrder {
                order_ref: order_ref.to_string(),
                batch_id: doc.batch.id,
            });
        }

        let highest = docs
            .iter()
            .flat_map(|doc| doc.items.iter().map(|i| i.id))
            .max()
            .unwrap_or_default();
        let mut doc = docs
            .into_iter()
            .find(|doc| doc.batch.id == batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        let mut counters = self.load_counters()?;
        counters.last_item_id = counters.last_item_id.max(highest) + 1;
        let item = ItemRecord::new(counters.last_item_id, batch_id, order_ref);
        doc.items.push(item.clone());

        self.save_counters(&counters)?;
        self.save_document(&doc)?;
        Ok(item)
    }

    fn items_by_status(
        &self,
        batch_id: BatchId,
        statuses: &[ItemStatus],
        field: StatusField,
    ) -> Result<Vec<ItemRecord>> {
        let _guard = self.lock()?;
        let Some(doc) = self.load_document(batch_id)? else {
            return Ok(Vec::new());
        };
        let mut items: Vec<_> = doc
            .items
            .into_iter()
            .filter(|i| matches_filter(i, statuses, field))
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    fn items_for_batch(&self, batch_id: BatchId) -> Result<Vec<ItemRecord>> {
        let _guard = self.lock()?;
        let mut items = self
            .load_document(batch_id)?
            .map(|doc| doc.items)
            .unwrap_or_default();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    fn find_item_by_order(&self, order_ref: &str) -> Result<Option<ItemRecord>> {
        let _guard = self.lock()?;
        Ok(self
            .all_documents()?
            .into_iter()
            .flat_map(|doc| doc.items)
            .find(|i| i.order_ref == order_ref))
    }

    fn save_item(&self, item: &ItemRecord) -> Result<()> {
        let _locks = self.write_lock()?;
        let mut doc = self.load_document(item.batch_id)?.ok_or(StoreError::ItemNotFound {
            batch_id: item.batch_id,
            item_id: item.id,
        })?;
        let slot = doc
            .items
            .iter_mut()
            .find(|i| i.id == item.id)
            .ok_or(StoreError::ItemNotFound {
                batch_id: item.batch_id,
                item_id: item.id,
            })?;
        *slot = item.clone();
        self.save_document(&doc)
    }
}

/// Exclusive `store.lock` file, removed on drop.
///
/// The file is created with `create_new`, so only one process holds it. A
/// lock whose mtime is older than [`WRITE_LOCK_STALE`] is left over from a
/// killed writer and is removed before trying again.
#[derive(Debug)]
struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    fn acquire(root: &Path, wait: Duration) -> Result<Self> {
        fs::create_dir_all(root).map_err(|source| StoreError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = root.join(WRITE_LOCK_FILE);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if modified_before(&path, WRITE_LOCK_STALE) {
                        tracing::warn!(path = %path.display(), "removing stale store write lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= wait {
                        return Err(StoreError::Busy { path });
                    }
                    thread::sleep(WRITE_LOCK_POLL);
                }
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn modified_before(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed > age)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Best-effort fsync of the parent directory so the rename survives a crash.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    {
        let mut f = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        f.write_all(&data).map_err(io_err(&tmp))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).map_err(io_err(path))?;
    fsync_parent_dir(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn empty_store_has_no_batches() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path().join("missing"));
        assert!(store.load_batch(1).expect("load").is_none());
        assert!(
            store
                .batches_by_status(BatchStatus::ALL)
                .expect("query")
                .is_empty()
        );
    }

    #[test]
    fn batches_and_items_survive_reopen() {
        let td = tempdir().expect("tempdir");
        let batch_id = {
            let store = FileStore::new(td.path());
            let batch = store.insert_batch("shop-7").expect("insert");
            let mut item = store.insert_item(batch.id, "order-1").expect("enroll");
            item.transition(ItemStatus::CollectionCompleted);
            item.collected_data = Some(serde_json::json!({"weight_grams": 300}));
            store.save_item(&item).expect("save item");
            batch.id
        };

        let reopened = FileStore::new(td.path());
        let batch = reopened.load_batch(batch_id).expect("load").expect("exists");
        assert_eq!(batch.scope_id, "shop-7");

        let items = reopened.items_for_batch(batch_id).expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ItemStatus::CollectionCompleted);
        assert_eq!(items[0].previous_status, Some(ItemStatus::PendingCollection));
        assert_eq!(
            items[0].collected_data,
            Some(serde_json::json!({"weight_grams": 300}))
        );
    }

    #[test]
    fn ids_keep_increasing_after_delete() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        let a = store.insert_batch("s").expect("insert");
        store.delete_batch(a.id).expect("delete");
        let b = store.insert_batch("s").expect("insert");
        assert!(b.id > a.id);
        assert!(matches!(
            store.delete_batch(a.id),
            Err(StoreError::BatchNotFound(_))
        ));
    }

    #[test]
    fn save_batch_rejects_stale_copy() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        let batch = store.insert_batch("s").expect("insert");

        let mut fresh = batch.clone();
        fresh.set_status(BatchStatus::CollectingData);
        store.save_batch(&mut fresh).expect("save");

        let mut stale = batch;
        stale.set_status(BatchStatus::Completed);
        assert!(matches!(
            store.save_batch(&mut stale),
            Err(StoreError::Conflict { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn duplicate_order_reports_owning_batch() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        let a = store.insert_batch("s").expect("insert");
        let b = store.insert_batch("s").expect("insert");
        store.insert_item(a.id, "o-1").expect("enroll");

        let err = store.insert_item(b.id, "o-1").expect_err("duplicate");
        assert_eq!(
            err.to_string(),
            format!("order o-1 is already enrolled in batch {}", a.id)
        );
        assert!(matches!(
            store.insert_item(99, "o-2"),
            Err(StoreError::BatchNotFound(99))
        ));
    }

    #[test]
    fn corrupt_document_surfaces_path() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        fs::create_dir_all(td.path().join(BATCHES_DIR)).expect("mkdir");
        fs::write(td.path().join(BATCHES_DIR).join("5.json"), "{not json").expect("write");

        let err = store.load_batch(5).expect_err("corrupt");
        assert!(matches!(err, StoreError::Json { .. }));
        assert!(err.to_string().contains("5.json"));
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        let batch = store.insert_batch("s").expect("insert");
        store.insert_item(batch.id, "o-1").expect("enroll");

        let leftovers: Vec<_> = fs::read_dir(td.path().join(BATCHES_DIR))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(!td.path().join(WRITE_LOCK_FILE).exists());
    }

    #[test]
    fn separate_handles_never_share_ids_or_orders() {
        let td = tempdir().expect("tempdir");
        let root = td.path().to_path_buf();
        let first = FileStore::new(&root).insert_batch("s").expect("insert");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = root.clone();
                thread::spawn(move || {
                    // One handle per thread, like two CLI processes.
                    let store = FileStore::new(root);
                    let mut batches = Vec::new();
                    let mut enrolled = 0;
                    for i in 0..10 {
                        batches.push(store.insert_batch("s").expect("insert").id);
                        if store.insert_item(first.id, &format!("o-{i}")).is_ok() {
                            enrolled += 1;
                        }
                    }
                    (batches, enrolled)
                })
            })
            .collect();

        let mut ids = vec![first.id];
        let mut enrolled = 0;
        for handle in handles {
            let (batches, count) = handle.join().expect("thread");
            ids.extend(batches);
            enrolled += count;
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 21);
        assert_eq!(enrolled, 10);

        let store = FileStore::new(&root);
        let items = store.items_for_batch(first.id).expect("items");
        assert_eq!(items.len(), 10);
        let mut item_ids: Vec<_> = items.iter().map(|i| i.id).collect();
        item_ids.dedup();
        assert_eq!(item_ids.len(), 10);
    }

    #[test]
    fn held_write_lock_makes_writes_busy() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path()).with_lock_wait(Duration::from_millis(50));
        let batch = store.insert_batch("s").expect("insert");

        fs::write(td.path().join(WRITE_LOCK_FILE), "4242\n").expect("write lock");
        assert!(matches!(
            store.insert_batch("s"),
            Err(StoreError::Busy { .. })
        ));
        assert!(matches!(
            store.insert_item(batch.id, "o-1"),
            Err(StoreError::Busy { .. })
        ));
        // Reads do not wait on writers.
        assert!(store.load_batch(batch.id).expect("load").is_some());
    }

    #[test]
    fn stale_write_lock_is_reclaimed() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path()).with_lock_wait(Duration::from_millis(50));
        let lock_path = td.path().join(WRITE_LOCK_FILE);
        fs::write(&lock_path, "4242\n").expect("write lock");
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&lock_path)
            .expect("open")
            .set_modified(old)
            .expect("set mtime");

        let batch = store.insert_batch("s").expect("insert");
        assert_eq!(batch.id, 1);
        assert!(!lock_path.exists());
    }

    #[test]
    fn lagging_counters_do_not_overwrite_existing_documents() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        let a = store.insert_batch("first").expect("insert");
        let item = store.insert_item(a.id, "o-1").expect("enroll");

        fs::write(td.path().join(IDS_FILE), r#"{"last_batch_id":0,"last_item_id":0}"#)
            .expect("reset counters");

        let b = store.insert_batch("second").expect("insert");
        assert!(b.id > a.id);
        let kept = store.load_batch(a.id).expect("load").expect("exists");
        assert_eq!(kept.scope_id, "first");

        let next = store.insert_item(b.id, "o-2").expect("enroll");
        assert!(next.id > item.id);
    }
}
