use anyhow::Result;
use plp_types::{Batch, BatchStatus, ItemRecord, ItemStatus, Stage, StatusField};

use crate::declaration::build_declaration;
use crate::engine::{ItemError, ItemOutcome, Pipeline, StageConfig, StageOperation, Tally};

/// Fetches each order from the host and stores its carrier declaration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataCollection;

impl StageOperation for DataCollection {
    fn config(&self) -> StageConfig {
        StageConfig {
            stage: Stage::Collection,
            required_status: BatchStatus::Open,
            in_progress_status: BatchStatus::CollectingData,
            success_status: BatchStatus::CollectingData,
            failure_status: BatchStatus::Open,
            eligible: &[ItemStatus::PendingCollection],
            eligible_field: StatusField::Status,
            item_in_progress: ItemStatus::ProcessingCollection,
            item_success: ItemStatus::CollectionCompleted,
            item_failure: ItemStatus::Error,
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
        let order = pipeline.orders.get_order(&item.order_ref)?;
        let declaration = build_declaration(&order, pipeline.opts)?;
        let profile = declaration.package.profile.clone();
        item.collected_data = Some(
            serde_json::to_value(&declaration)
                .map_err(|e| ItemError::permanent(format!("failed to encode declaration: {e}")))?,
        );
        Ok(ItemOutcome::completed(format!("{}:{profile}", item.order_ref)))
    }

    /// The batch only moves on once every item collected cleanly.
    fn final_status(&self, pipeline: &Pipeline<'_>, batch: &Batch, tally: &mut Tally) -> Result<BatchStatus> {
        let pending = pipeline.store.items_by_status(
            batch.id,
            &[ItemStatus::PendingCollection],
            StatusField::Status,
        )?;
        if tally.errors == 0 && pending.is_empty() {
            Ok(BatchStatus::CollectingData)
        } else {
            Ok(BatchStatus::Open)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::fixtures::World;
    use crate::stages::run;

    #[test]
    fn collects_declarations_for_every_item() {
        let world = World::new(&["o-1", "o-2"]);
        let batch = world.seed(BatchStatus::Open, &["o-1", "o-2"], ItemStatus::PendingCollection);

        let result = run(&world.pipeline(), Stage::Collection, batch.id);

        assert!(result.success, "{}", result.message);
        assert_eq!(result.processed, 2);
        assert_eq!(result.status, Some(BatchStatus::CollectingData));
        assert_eq!(result.data, vec!["o-1:small", "o-2:small"]);

        let item = world.item("o-1");
        assert_eq!(item.status, ItemStatus::CollectionCompleted);
        let decl: plp_types::Declaration =
            serde_json::from_value(item.collected_data.expect("collected")).expect("declaration");
        assert_eq!(decl.sender.name, "Sender Shop");
        assert_eq!(decl.recipient.address.postal_code, "50000000");
    }

    #[test]
    fn one_bad_order_keeps_batch_open() {
        let world = World::new(&["o-1", "o-3"]);
        let batch = world.seed(
            BatchStatus::Open,
            &["o-1", "o-2", "o-3"],
            ItemStatus::PendingCollection,
        );

        let result = run(&world.pipeline(), Stage::Collection, batch.id);

        assert!(!result.success);
        assert_eq!(result.processed, 3);
        assert_eq!(result.errors, 1);
        assert_eq!(result.status, Some(BatchStatus::Open));
        assert_eq!(world.item("o-1").status, ItemStatus::CollectionCompleted);
        assert_eq!(world.item("o-3").status, ItemStatus::CollectionCompleted);

        let failed = world.item("o-2");
        assert_eq!(failed.status, ItemStatus::Error);
        assert_eq!(failed.previous_status, Some(ItemStatus::ProcessingCollection));
        assert!(failed.error_message.expect("message").contains("o-2 not found"));
    }

    #[test]
    fn missing_sender_fails_items_not_the_run() {
        let mut world = World::new(&["o-1"]);
        world.opts.sender = plp_types::Party::default();
        let batch = world.seed(BatchStatus::Open, &["o-1"], ItemStatus::PendingCollection);

        let result = run(&world.pipeline(), Stage::Collection, batch.id);

        assert_eq!(result.errors, 1);
        assert_eq!(world.batch(batch.id).status, BatchStatus::Open);
        assert_eq!(world.item("o-1").status, ItemStatus::Error);
    }
}
