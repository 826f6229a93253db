//! Administrative batch operations: creation, enrollment, overrides,
//! retries and deletion.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use plp_config::RuntimeOptions;
use plp_events::{EventLog, events_path};
use plp_lock::BatchLease;
use plp_store::PlpStore;
use plp_types::{
    Batch, BatchId, BatchStatus, EventType, ItemRecord, ItemStatus, PipelineEvent, Stage,
    StatusField,
};
use serde::Serialize;
use tracing::{info, warn};

/// Item status a failed item returns to when retried, per stage.
pub fn retry_transition(stage: Stage) -> (ItemStatus, ItemStatus) {
    match stage {
        Stage::Collection => (ItemStatus::Error, ItemStatus::PendingCollection),
        Stage::Submission => (ItemStatus::SubmitError, ItemStatus::CollectionCompleted),
        Stage::LabelRequest => (
            ItemStatus::ReceiptCreationError,
            ItemStatus::PendingRequestLabels,
        ),
        Stage::LabelDownload => (ItemStatus::DownloadError, ItemStatus::PendingDownload),
        Stage::Shipment => (ItemStatus::ShipCreateError, ItemStatus::DownloadCompleted),
    }
}

/// A batch with its item counts per status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch: Batch,
    pub items: usize,
    pub by_status: BTreeMap<ItemStatus, usize>,
    /// Items carrying an error message
    pub errors: Vec<ItemRecord>,
}

/// Operator-facing operations on batches.
pub struct Admin<'a> {
    store: &'a dyn PlpStore,
    lock_dir: Option<PathBuf>,
    lock_timeout: Duration,
    events_path: Option<PathBuf>,
}

impl<'a> Admin<'a> {
    /// Leases and audit events under `opts.state_dir`.
    pub fn new(store: &'a dyn PlpStore, opts: &RuntimeOptions) -> Self {
        Self {
            store,
            lock_dir: Some(opts.lock_dir()),
            lock_timeout: opts.lock_timeout,
            events_path: Some(events_path(&opts.state_dir)),
        }
    }

    /// No leases, no audit file.
    pub fn in_memory(store: &'a dyn PlpStore) -> Self {
        Self {
            store,
            lock_dir: None,
            lock_timeout: Duration::from_secs(3600),
            events_path: None,
        }
    }

    pub fn create_batch(&self, scope_id: &str) -> Result<Batch> {
        if scope_id.trim().is_empty() {
            bail!("scope id must not be empty");
        }
        let batch = self.store.insert_batch(scope_id.trim())?;
        info!(batch_id = batch.id, scope_id = %batch.scope_id, "batch created");
        Ok(batch)
    }

    /// Add `order_ref` to an `Open` batch.
    pub fn enroll_order(&self, batch_id: BatchId, order_ref: &str) -> Result<ItemRecord> {
        let order_ref = order_ref.trim();
        if order_ref.is_empty() {
            bail!("order reference must not be empty");
        }
        let _lease = self.lease(batch_id)?;
        let batch = self.load(batch_id)?;
        if batch.status != BatchStatus::Open {
            bail!(
                "batch {batch_id} is {}; orders can only be enrolled while it is open",
                batch.status
            );
        }
        let item = self.store.insert_item(batch_id, order_ref)?;
        info!(batch_id, order_ref, item_id = item.id, "order enrolled");
        Ok(item)
    }

    pub fn set_remote_enabled(&self, batch_id: BatchId, enabled: bool) -> Result<Batch> {
        let _lease = self.lease(batch_id)?;
        let mut batch = self.load(batch_id)?;
        batch.remote_enabled = enabled;
        self.store.save_batch(&mut batch)?;
        info!(batch_id, enabled, "remote processing toggled");
        Ok(batch)
    }

    /// Force a batch into `status`, bypassing the stage state machine.
    pub fn override_status(&self, batch_id: BatchId, status: BatchStatus) -> Result<Batch> {
        let _lease = self.lease(batch_id)?;
        let mut batch = self.load(batch_id)?;
        let from = batch.status;
        batch.set_status(status);
        self.store.save_batch(&mut batch)?;
        warn!(batch_id, %from, to = %status, "batch status overridden");
        self.record(PipelineEvent::batch(
            batch_id,
            EventType::StatusOverridden { from, to: status },
        ));
        Ok(batch)
    }

    /// Move items that failed `stage` back to the status the stage picks up.
    /// Error messages are kept. Returns the number of items moved.
    pub fn retry_failed(&self, batch_id: BatchId, stage: Stage) -> Result<usize> {
        let _lease = self.lease(batch_id)?;
        self.load(batch_id)?;
        let (failed, reentry) = retry_transition(stage);
        let items = self
            .store
            .items_by_status(batch_id, &[failed], StatusField::Status)?;
        for mut item in items.iter().cloned() {
            item.transition(reentry);
            item.processing_data.synchronizing = None;
            self.store
                .save_item(&item)
                .with_context(|| format!("failed to save item {}", item.id))?;
        }
        info!(batch_id, %stage, count = items.len(), from = %failed, to = %reentry, "failed items queued for retry");
        Ok(items.len())
    }

    /// Remove a batch that never reached the carrier.
    pub fn delete_batch(&self, batch_id: BatchId) -> Result<()> {
        let _lease = self.lease(batch_id)?;
        let batch = self.load(batch_id)?;
        if batch.status.is_remote_processing() {
            bail!(
                "batch {batch_id} is {}; batches with carrier-side data cannot be deleted",
                batch.status
            );
        }
        self.store.delete_batch(batch_id)?;
        info!(batch_id, "batch deleted");
        Ok(())
    }

    pub fn batch_summary(&self, batch_id: BatchId) -> Result<BatchSummary> {
        let batch = self.load(batch_id)?;
        let items = self.store.items_for_batch(batch_id)?;
        let mut by_status = BTreeMap::new();
        for item in &items {
            *by_status.entry(item.status).or_insert(0) += 1;
        }
        Ok(BatchSummary {
            batch,
            items: items.len(),
            by_status,
            errors: items
                .into_iter()
                .filter(|item| item.error_message.is_some())
                .collect(),
        })
    }

    /// All batches, optionally restricted to `statuses`.
    pub fn list_batches(&self, statuses: Option<&[BatchStatus]>) -> Result<Vec<Batch>> {
        Ok(self
            .store
            .batches_by_status(statuses.unwrap_or(BatchStatus::ALL))?)
    }

    fn load(&self, batch_id: BatchId) -> Result<Batch> {
        self.store
            .load_batch(batch_id)?
            .with_context(|| format!("batch {batch_id} not found"))
    }

    fn lease(&self, batch_id: BatchId) -> Result<Option<BatchLease>> {
        self.lock_dir
            .as_deref()
            .map(|dir| BatchLease::acquire_with_timeout(dir, batch_id, None, self.lock_timeout))
            .transpose()
    }

    fn record(&self, event: PipelineEvent) {
        let Some(path) = &self.events_path else {
            return;
        };
        let mut log = EventLog::new();
        log.record(event);
        if let Err(e) = log.write_to_file(path) {
            warn!(path = %path.display(), "failed to append audit event: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use plp_store::MemoryStore;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn enrollment_requires_open_batch_and_unique_order() {
        let store = MemoryStore::new();
        let admin = Admin::in_memory(&store);
        let a = admin.create_batch("shop-1").expect("batch");
        let b = admin.create_batch("shop-1").expect("batch");

        let item = admin.enroll_order(a.id, " o-1 ").expect("enroll");
        assert_eq!(item.order_ref, "o-1");
        assert_eq!(item.status, ItemStatus::PendingCollection);

        let err = admin.enroll_order(b.id, "o-1").expect_err("duplicate");
        assert!(err.to_string().contains("already enrolled"));

        admin
            .override_status(b.id, BatchStatus::CollectingData)
            .expect("override");
        let err = admin.enroll_order(b.id, "o-2").expect_err("not open");
        assert!(err.to_string().contains("only be enrolled while it is open"));
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        let store = MemoryStore::new();
        let admin = Admin::in_memory(&store);
        assert!(admin.create_batch("  ").is_err());
        let batch = admin.create_batch("s").expect("batch");
        assert!(admin.enroll_order(batch.id, "").is_err());
        assert!(admin.enroll_order(99, "o-1").is_err());
    }

    #[test]
    fn retry_failed_moves_items_back_and_keeps_message() {
        let store = MemoryStore::new();
        let admin = Admin::in_memory(&store);
        let batch = admin.create_batch("s").expect("batch");
        let mut item = admin.enroll_order(batch.id, "o-1").expect("enroll");
        item.fail(ItemStatus::DownloadError, "timeout");
        item.processing_data.mark_synchronizing(chrono::Utc::now());
        plp_store::ItemRepository::save_item(&store, &item).expect("save");
        admin.enroll_order(batch.id, "o-2").expect("enroll");

        assert_eq!(admin.retry_failed(batch.id, Stage::Submission).expect("retry"), 0);
        assert_eq!(admin.retry_failed(batch.id, Stage::LabelDownload).expect("retry"), 1);

        let summary = admin.batch_summary(batch.id).expect("summary");
        assert_eq!(summary.items, 2);
        assert_eq!(summary.by_status.get(&ItemStatus::PendingDownload), Some(&1));
        assert_eq!(summary.by_status.get(&ItemStatus::PendingCollection), Some(&1));
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].error_message.as_deref(), Some("timeout"));
        assert!(summary.errors[0].processing_data.synchronizing.is_none());
    }

    #[test]
    fn retry_transitions_cover_every_stage() {
        for stage in Stage::ALL {
            let (failed, reentry) = retry_transition(*stage);
            assert_ne!(failed, reentry);
        }
        assert_eq!(
            retry_transition(Stage::Shipment),
            (ItemStatus::ShipCreateError, ItemStatus::DownloadCompleted)
        );
    }

    #[test]
    fn remote_batches_cannot_be_deleted() {
        let store = MemoryStore::new();
        let admin = Admin::in_memory(&store);
        let local = admin.create_batch("s").expect("batch");
        let remote = admin.create_batch("s").expect("batch");
        admin
            .override_status(remote.id, BatchStatus::RequestingReceipt)
            .expect("override");

        admin.delete_batch(local.id).expect("delete local");
        let err = admin.delete_batch(remote.id).expect_err("remote");
        assert!(err.to_string().contains("cannot be deleted"));

        let remaining = admin.list_batches(None).expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, remote.id);
        assert!(
            admin
                .list_batches(Some(&[BatchStatus::Open]))
                .expect("list")
                .is_empty()
        );
    }

    #[test]
    fn leased_batch_refuses_overrides() {
        let td = tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let mut opts = RuntimeOptions::default();
        opts.state_dir = td.path().to_path_buf();
        let admin = Admin::new(&store, &opts);
        let batch = admin.create_batch("s").expect("batch");

        let held = BatchLease::acquire(&opts.lock_dir(), batch.id, Some(Stage::Submission))
            .expect("lease");
        let err = admin
            .override_status(batch.id, BatchStatus::Completed)
            .expect_err("leased");
        assert!(err.to_string().contains("is leased by pid"));
        drop(held);

        let batch = admin
            .override_status(batch.id, BatchStatus::Completed)
            .expect("override");
        assert_eq!(batch.status, BatchStatus::Completed);

        let events = EventLog::read_from_file(&events_path(td.path())).expect("events");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events.all_events()[0].event_type,
            EventType::StatusOverridden {
                from: BatchStatus::Open,
                to: BatchStatus::Completed
            }
        ));
    }

    #[test]
    fn toggling_remote_processing_persists() {
        let store = MemoryStore::new();
        let admin = Admin::in_memory(&store);
        let batch = admin.create_batch("s").expect("batch");
        admin.set_remote_enabled(batch.id, false).expect("toggle");
        assert!(!admin.batch_summary(batch.id).expect("summary").batch.remote_enabled);
    }
}
