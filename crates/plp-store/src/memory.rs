//! In-process repository backend.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use plp_types::{Batch, BatchId, BatchStatus, ItemId, ItemRecord, ItemStatus, StatusField};

use crate::{BatchRepository, ItemRepository, Result, StoreError, matches_filter};

#[derive(Debug, Default)]
struct Tables {
    batches: BTreeMap<BatchId, Batch>,
    items: BTreeMap<ItemId, ItemRecord>,
    last_batch_id: BatchId,
    last_item_id: ItemId,
}

/// Mutex-guarded in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl BatchRepository for MemoryStore {
    fn insert_batch(&self, scope_id: &str) -> Result<Batch> {
        let mut tables = self.lock()?;
        tables.last_batch_id += 1;
        let mut batch = Batch::new(tables.last_batch_id, scope_id);
        batch.version = 1;
        tables.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    fn load_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.lock()?.batches.get(&id).cloned())
    }

    fn save_batch(&self, batch: &mut Batch) -> Result<()> {
        let mut tables = self.lock()?;
        let stored = tables
            .batches
            .get_mut(&batch.id)
            .ok_or(StoreError::BatchNotFound(batch.id))?;
        if stored.version != batch.version {
            return Err(StoreError::Conflict {
                batch_id: batch.id,
                expected: batch.version,
                found: stored.version,
            });
        }
        batch.version += 1;
        batch.updated_at = Utc::now();
        *stored = batch.clone();
        Ok(())
    }

    fn batches_by_status(&self, statuses: &[BatchStatus]) -> Result<Vec<Batch>> {
        Ok(self
            .lock()?
            .batches
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    fn delete_batch(&self, id: BatchId) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.batches.remove(&id).is_none() {
            return Err(StoreError::BatchNotFound(id));
        }
        tables.items.retain(|_, item| item.batch_id != id);
        Ok(())
    }
}

impl ItemRepository for MemoryStore {
    fn insert_item(&self, batch_id: BatchId, order_ref: &str) -> Result<ItemRecord> {
        let mut tables = self.lock()?;
        if !tables.batches.contains_key(&batch_id) {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        if let Some(existing) = tables.items.values().find(|i| i.order_ref == order_ref) {
            return Err(StoreError::DuplicateOrder {
                order_ref: order_ref.to_string(),
                batch_id: existing.batch_id,
            });
        }
        tables.last_item_id += 1;
        let item = ItemRecord::new(tables.last_item_id, batch_id, order_ref);
        tables.items.insert(item.id, item.clone());
        Ok(item)
    }

    fn items_by_status(
        &self,
        batch_id: BatchId,
        statuses: &[ItemStatus],
        field: StatusField,
    ) -> Result<Vec<ItemRecord>> {
        Ok(self
            .lock()?
            .items
            .values()
            .filter(|i| i.batch_id == batch_id && matches_filter(i, statuses, field))
            .cloned()
            .collect())
    }

    fn items_for_batch(&self, batch_id: BatchId) -> Result<Vec<ItemRecord>> {
        Ok(self
            .lock()?
            .items
            .values()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect())
    }

    fn find_item_by_order(&self, order_ref: &str) -> Result<Option<ItemRecord>> {
        Ok(self
            .lock()?
            .items
            .values()
            .find(|i| i.order_ref == order_ref)
            .cloned())
    }

    fn save_item(&self, item: &ItemRecord) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.items.get_mut(&item.id) {
            Some(stored) if stored.batch_id == item.batch_id => {
                *stored = item.clone();
                Ok(())
            }
            _ => Err(StoreError::ItemNotFound {
                batch_id: item.batch_id,
                item_id: item.id,
            }),
        }
    }
}
