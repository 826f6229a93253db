use anyhow::Result;
use chrono::Utc;
use plp_types::{Batch, BatchStatus, Declaration, ItemRecord, ItemStatus, Stage, StatusField};

use crate::engine::{ItemError, ItemOutcome, Pipeline, StageConfig, StageOperation, Tally};

/// Submits collected declarations to the carrier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission;

impl StageOperation for Submission {
    fn config(&self) -> StageConfig {
        StageConfig {
            stage: Stage::Submission,
            required_status: BatchStatus::CollectingData,
            in_progress_status: BatchStatus::InCommunication,
            success_status: BatchStatus::RequestingReceipt,
            failure_status: BatchStatus::CollectingData,
            eligible: &[ItemStatus::CollectionCompleted],
            eligible_field: StatusField::Status,
            item_in_progress: ItemStatus::ProcessingSubmit,
            item_success: ItemStatus::SubmitCreated,
            item_failure: ItemStatus::SubmitError,
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
        let Some(data) = item.collected_data.clone() else {
            return Err(ItemError::permanent("no collected declaration; run collection again"));
        };
        let declaration: Declaration = serde_json::from_value(data)
            .map_err(|e| ItemError::permanent(format!("stored declaration is invalid: {e}")))?;

        let submitted = pipeline.carrier.submit(&declaration)?;
        let processing = &mut item.processing_data;
        processing.external_id = Some(submitted.external_id);
        processing.tracking_code = Some(submitted.tracking_code.clone());
        processing.submitted_at = Some(Utc::now());
        Ok(ItemOutcome::completed(submitted.tracking_code))
    }

    /// A single accepted declaration is enough to move on; rejected items
    /// stay behind for `retry-failed`.
    fn final_status(&self, _pipeline: &Pipeline<'_>, _batch: &Batch, tally: &mut Tally) -> Result<BatchStatus> {
        Ok(if tally.succeeded > 0 {
            BatchStatus::RequestingReceipt
        } else {
            BatchStatus::CollectingData
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::fixtures::World;
    use crate::stages::{DataCollection, run};
    use crate::engine::run_stage;

    fn collected(world: &World, orders: &[&str]) -> Batch {
        let batch = world.seed(BatchStatus::Open, orders, ItemStatus::PendingCollection);
        let result = run_stage(&world.pipeline(), &DataCollection, batch.id);
        assert!(result.success, "{}", result.message);
        world.batch(batch.id)
    }

    #[test]
    fn submits_and_records_tracking_codes() {
        let world = World::new(&["o-1", "o-2"]);
        let batch = collected(&world, &["o-1", "o-2"]);

        let result = run(&world.pipeline(), Stage::Submission, batch.id);

        assert!(result.success, "{}", result.message);
        assert_eq!(result.status, Some(BatchStatus::RequestingReceipt));
        assert_eq!(result.data, vec!["TRK-o-1", "TRK-o-2"]);

        let item = world.item("o-2");
        assert_eq!(item.status, ItemStatus::SubmitCreated);
        assert_eq!(item.processing_data.external_id.as_deref(), Some("ext-o-2"));
        assert!(item.processing_data.submitted_at.is_some());
    }

    #[test]
    fn partial_rejection_still_advances_batch() {
        let mut world = World::new(&["o-1", "o-2"]);
        world.carrier.reject_submit.insert("o-2".into());
        let batch = collected(&world, &["o-1", "o-2"]);

        let result = run(&world.pipeline(), Stage::Submission, batch.id);

        assert!(!result.success);
        assert_eq!(result.errors, 1);
        assert_eq!(result.status, Some(BatchStatus::RequestingReceipt));
        let rejected = world.item("o-2");
        assert_eq!(rejected.status, ItemStatus::SubmitError);
        assert_eq!(
            rejected.error_message.as_deref(),
            Some("rejected with HTTP 422: declaration rejected")
        );
    }

    #[test]
    fn all_rejected_returns_to_collecting_data() {
        let mut world = World::new(&["o-1"]);
        world.carrier.reject_submit.insert("o-1".into());
        let batch = collected(&world, &["o-1"]);

        let result = run(&world.pipeline(), Stage::Submission, batch.id);
        assert_eq!(result.status, Some(BatchStatus::CollectingData));
    }

    #[test]
    fn item_without_declaration_fails_without_calling_carrier() {
        let world = World::new(&["o-1"]);
        let batch = world.seed(
            BatchStatus::CollectingData,
            &["o-1"],
            ItemStatus::CollectionCompleted,
        );

        let result = run(&world.pipeline(), Stage::Submission, batch.id);

        assert_eq!(result.errors, 1);
        assert!(world.carrier.submits.borrow().is_empty());
        assert_eq!(world.item("o-1").status, ItemStatus::SubmitError);
    }
}
