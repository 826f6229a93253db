use anyhow::Result;
use plp_types::{Batch, BatchStatus, ItemRecord, ItemStatus, Stage, StatusField};

use crate::engine::{ItemError, ItemOutcome, Pipeline, StageConfig, StageOperation, Tally};

/// Asks the carrier to start generating labels for submitted items.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelRequest;

impl StageOperation for LabelRequest {
    fn config(&self) -> StageConfig {
        StageConfig {
            stage: Stage::LabelRequest,
            required_status: BatchStatus::RequestingReceipt,
            in_progress_status: BatchStatus::RequestingFileCreation,
            success_status: BatchStatus::RequestingShipmentCreation,
            failure_status: BatchStatus::RequestingReceipt,
            eligible: &[ItemStatus::SubmitCreated, ItemStatus::PendingRequestLabels],
            eligible_field: StatusField::Status,
            item_in_progress: ItemStatus::ProcessingRequestLabels,
            item_success: ItemStatus::ReceiptCreated,
            item_failure: ItemStatus::ReceiptCreationError,
            item_synchronizing: None,
            strict_validation: false,
        }
    }

    fn process_item(
        &self,
        pipeline: &Pipeline<'_>,
        _batch: &Batch,
        item: &mut ItemRecord,
    ) -> Result<ItemOutcome, ItemError> {
        // A receipt from an earlier run is still valid.
        if let Some(receipt_id) = &item.processing_data.receipt_id {
            return Ok(ItemOutcome::completed(receipt_id.clone()));
        }
        let Some(tracking_code) = item.processing_data.tracking_code.clone() else {
            return Err(ItemError::permanent("item has no tracking code; submit it first"));
        };

        let receipt = pipeline.carrier.request_label(&tracking_code)?;
        item.processing_data.receipt_id = Some(receipt.receipt_id.clone());
        Ok(ItemOutcome::completed(receipt.receipt_id))
    }

    fn final_status(&self, _pipeline: &Pipeline<'_>, _batch: &Batch, tally: &mut Tally) -> Result<BatchStatus> {
        Ok(if tally.succeeded > 0 {
            BatchStatus::RequestingShipmentCreation
        } else {
            BatchStatus::RequestingReceipt
        })
    }
}
