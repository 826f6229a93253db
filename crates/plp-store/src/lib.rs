//! Batch and item repositories.
//!
//! The pipeline only talks to persistence through [`BatchRepository`] and
//! [`ItemRepository`]. Two backends ship with the crate:
//!
//! - [`FileStore`]: one JSON document per batch under a state directory,
//!   written atomically (tmp file + rename).
//! - [`MemoryStore`]: a mutex-guarded in-process map, used by tests and by
//!   embedders that bring their own durability.
//!
//! Both backends enforce optimistic concurrency on batches: a save fails with
//! [`StoreError::Conflict`] when the stored version moved since the batch
//! was loaded.

use std::path::PathBuf;

use plp_types::{Batch, BatchId, BatchStatus, ItemId, ItemRecord, ItemStatus, StatusField};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors produced by repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("item {item_id} not found in batch {batch_id}")]
    ItemNotFound { batch_id: BatchId, item_id: ItemId },

    /// The batch was saved by someone else since it was loaded.
    #[error("batch {batch_id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        batch_id: BatchId,
        expected: u64,
        found: u64,
    },

    #[error("order {order_ref} is already enrolled in batch {batch_id}")]
    DuplicateOrder { order_ref: String, batch_id: BatchId },

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another process held the store write lock for the whole wait.
    #[error("store is busy: write lock {} is held by another process", .path.display())]
    Busy { path: PathBuf },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract for batches.
pub trait BatchRepository: Send + Sync {
    /// Allocate and persist a new, empty `Open` batch.
    fn insert_batch(&self, scope_id: &str) -> Result<Batch>;

    /// Returns `Ok(None)` when no batch has this id.
    fn load_batch(&self, id: BatchId) -> Result<Option<Batch>>;

    /// Persist `batch`, bumping its version on success.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when the stored version differs from
    /// `batch.version`; [`StoreError::BatchNotFound`] when it was deleted.
    fn save_batch(&self, batch: &mut Batch) -> Result<()>;

    /// All batches whose status is in `statuses`, ordered by id.
    fn batches_by_status(&self, statuses: &[BatchStatus]) -> Result<Vec<Batch>>;

    /// Remove a batch and its items.
    fn delete_batch(&self, id: BatchId) -> Result<()>;
}

/// Persistence contract for the items of a batch.
pub trait ItemRepository: Send + Sync {
    /// Enroll `order_ref` in `batch_id` as a `pending_collection` item.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateOrder`] when the order is enrolled anywhere.
    fn insert_item(&self, batch_id: BatchId, order_ref: &str) -> Result<ItemRecord>;

    /// Items of `batch_id` whose `field` axis holds one of `statuses`,
    /// ordered by id.
    fn items_by_status(
        &self,
        batch_id: BatchId,
        statuses: &[ItemStatus],
        field: StatusField,
    ) -> Result<Vec<ItemRecord>>;

    /// Every item of `batch_id`, ordered by id.
    fn items_for_batch(&self, batch_id: BatchId) -> Result<Vec<ItemRecord>>;

    fn find_item_by_order(&self, order_ref: &str) -> Result<Option<ItemRecord>>;

    /// Overwrite a stored item.
    fn save_item(&self, item: &ItemRecord) -> Result<()>;
}

/// Everything the pipeline needs from persistence.
pub trait PlpStore: BatchRepository + ItemRepository {}

impl<T: BatchRepository + ItemRepository> PlpStore for T {}

pub(crate) fn matches_filter(item: &ItemRecord, statuses: &[ItemStatus], field: StatusField) -> bool {
    item.status_on(field)
        .is_some_and(|status| statuses.contains(&status))
}
