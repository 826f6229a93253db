use anyhow::{Context, Result};
use chrono::Utc;
use plp_gateway::LabelDownload as Download;
use plp_store::PlpStore;
use plp_types::{Batch, BatchId, BatchStatus, ItemId, ItemRecord, ItemStatus, Stage, StatusField};
use tracing::info;

use crate::engine::{ItemError, ItemOutcome, Pipeline, StageConfig, StageOperation, Tally};

/// Polls the carrier for generated labels and archives them.
///
/// Label generation is asynchronous on the carrier side, so an item may be
/// answered with "still synchronizing" any number of times. Such items are
/// parked in `pending_download` and are not errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelDownload;

impl StageOperation for LabelDownload {
    fn config(&self) -> StageConfig {
        StageConfig {
            stage: Stage::LabelDownload,
            required_status: BatchStatus::RequestingShipmentCreation,
            in_progress_status: BatchStatus::DownloadingLabels,
            success_status: BatchStatus::AwaitingShipment,
            failure_status: BatchStatus::RequestingShipmentCreation,
            eligible: &[ItemStatus::ReceiptCreated, ItemStatus::PendingDownload],
            eligible_field: StatusField::Status,
            item_in_progress: ItemStatus::ProcessingDownload,
            item_success: ItemStatus::DownloadCompleted,
            item_failure: ItemStatus::DownloadError,
            item_synchronizing: Some(ItemStatus::PendingDownload),
            strict_validation: false,
        }
    }

    fn process_item(
        &self,
        pipeline: &Pipeline<'_>,
        batch: &Batch,
        item: &mut ItemRecord,
    ) -> Result<ItemOutcome, ItemError> {
        let Some(receipt_id) = item.processing_data.receipt_id.clone() else {
            return Err(ItemError::permanent("item has no label receipt; request labels first"));
        };

        match pipeline.carrier.download_label(&receipt_id)? {
            Download::Synchronizing => {
                item.processing_data.mark_synchronizing(Utc::now());
                Ok(ItemOutcome::Synchronizing)
            }
            Download::Ready(artifact) => {
                let reference = pipeline
                    .labels
                    .store(batch.id, &item.order_ref, &artifact)
                    .map_err(|e| ItemError::retryable(format!("failed to store label: {e:#}")))?;
                item.processing_data.label_file = Some(reference.clone());
                item.processing_data.synchronizing = None;
                Ok(ItemOutcome::completed(reference))
            }
        }
    }

    /// The batch moves on only when every polled label came through. A pass
    /// where nothing came through and nothing is still being generated puts
    /// the items that failed back to `receipt_created` for the next run.
    fn final_status(&self, pipeline: &Pipeline<'_>, batch: &Batch, tally: &mut Tally) -> Result<BatchStatus> {
        if tally.succeeded > 0 && tally.errors == 0 && tally.synchronizing == 0 {
            return Ok(BatchStatus::AwaitingShipment);
        }
        if tally.succeeded == 0 && tally.synchronizing == 0 {
            tally.recovered = reset_failed(pipeline.store, batch.id, &tally.failed_items)?;
        }
        Ok(BatchStatus::RequestingShipmentCreation)
    }
}

fn reset_failed(store: &dyn PlpStore, batch_id: BatchId, failed_ids: &[ItemId]) -> Result<usize> {
    let failed = store
        .items_by_status(batch_id, &[ItemStatus::DownloadError], StatusField::Status)
        .context("failed to select failed downloads")?;
    let mut count = 0;
    for mut item in failed.into_iter().filter(|item| failed_ids.contains(&item.id)) {
        item.transition(ItemStatus::ReceiptCreated);
        item.processing_data.synchronizing = None;
        store
            .save_item(&item)
            .with_context(|| format!("failed to reset item {}", item.id))?;
        info!(item_id = item.id, order_ref = %item.order_ref, "label download reset for another pass");
        count += 1;
    }
    Ok(count)
}
