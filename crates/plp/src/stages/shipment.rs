use anyhow::Result;
use plp_gateway::ShipmentRecord;
use plp_types::{Batch, BatchStatus, ItemRecord, ItemStatus, Stage, StatusField};
use tracing::warn;

use crate::engine::{ItemError, ItemOutcome, Pipeline, StageConfig, StageOperation, Tally};

/// Registers a host shipment for every downloaded label.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShipmentCreation;

impl StageOperation for ShipmentCreation {
    fn config(&self) -> StageConfig {
        StageConfig {
            stage: Stage::Shipment,
            required_status: BatchStatus::AwaitingShipment,
            in_progress_status: BatchStatus::CreatingShipments,
            success_status: BatchStatus::Completed,
            failure_status: BatchStatus::AwaitingShipment,
            eligible: &[ItemStatus::DownloadCompleted],
            eligible_field: StatusField::Status,
            item_in_progress: ItemStatus::ProcessingShipCreate,
            item_success: ItemStatus::ShipCreated,
            item_failure: ItemStatus::ShipCreateError,
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
        if let Some(shipment_ref) = &item.shipment_ref {
            return Ok(ItemOutcome::completed(shipment_ref.clone()));
        }

        let shipments = pipeline.shipments;
        if !shipments.is_shippable(&item.order_ref)? {
            return Err(ItemError::permanent(format!(
                "order {} cannot be shipped in its current state",
                item.order_ref
            )));
        }

        let data = &item.processing_data;
        let (Some(tracking_code), Some(label_file)) = (&data.tracking_code, &data.label_file) else {
            return Err(ItemError::permanent("item has no tracking code or label file"));
        };
        let record = ShipmentRecord {
            order_ref: item.order_ref.clone(),
            tracking_code: tracking_code.clone(),
            label_file: label_file.clone(),
            service_code: pipeline.opts.carrier.service_code.clone(),
        };
        let shipment_ref = shipments.register_shipment(&record)?;
        item.shipment_ref = Some(shipment_ref.clone());

        if pipeline.opts.host.notify_customer {
            if let Err(e) = shipments.notify(&shipment_ref) {
                warn!(order_ref = %item.order_ref, shipment_ref = %shipment_ref, "customer notification failed: {e}");
            }
        }
        Ok(ItemOutcome::completed(shipment_ref))
    }

    fn final_status(&self, _pipeline: &Pipeline<'_>, _batch: &Batch, tally: &mut Tally) -> Result<BatchStatus> {
        Ok(if tally.errors == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::AwaitingShipment
        })
    }
}
