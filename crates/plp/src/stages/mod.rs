//! The five pipeline stages.

use anyhow::{Context, Result};
use plp_types::{BatchId, Stage, StageResult};
use tracing::info;

use crate::engine::{Pipeline, StageOperation, run_stage};

mod collection;
mod label_download;
mod label_request;
mod shipment;
mod submission;

pub use collection::DataCollection;
pub use label_download::LabelDownload;
pub use label_request::LabelRequest;
pub use shipment::ShipmentCreation;
pub use submission::Submission;

/// The operation implementing `stage`.
pub fn operation(stage: Stage) -> &'static dyn StageOperation {
    match stage {
        Stage::Collection => &DataCollection,
        Stage::Submission => &Submission,
        Stage::LabelRequest => &LabelRequest,
        Stage::LabelDownload => &LabelDownload,
        Stage::Shipment => &ShipmentCreation,
    }
}

/// Run `stage` on `batch_id`.
pub fn run(pipeline: &Pipeline<'_>, stage: Stage, batch_id: BatchId) -> StageResult {
    run_stage(pipeline, operation(stage), batch_id)
}

/// Run `stage` once on every enabled batch waiting for it, in id order.
pub fn run_ready(pipeline: &Pipeline<'_>, stage: Stage) -> Result<Vec<StageResult>> {
    let required = operation(stage).config().required_status;
    let mut batches = pipeline
        .store
        .batches_by_status(&[required])
        .with_context(|| format!("failed to list batches ready for {stage}"))?;
    batches.retain(|batch| batch.remote_enabled);
    batches.sort_by_key(|batch| batch.id);
    info!(%stage, batches = batches.len(), "running stage over ready batches");

    Ok(batches
        .into_iter()
        .map(|batch| run(pipeline, stage, batch.id))
        .collect())
}


#[cfg(test)]
mod tests {
    use plp_store::BatchRepository;
    use plp_types::{BatchStatus, ItemStatus};

    use super::fixtures::World;
    use super::*;

    #[test]
    fn run_ready_covers_enabled_batches_in_the_required_status() {
        let world = World::new(&["o-1", "o-2"]);
        let first = world.seed(BatchStatus::Open, &["o-1"], ItemStatus::PendingCollection);
        let second = world.seed(BatchStatus::Open, &["o-2"], ItemStatus::PendingCollection);
        let mut disabled = world.seed(BatchStatus::Open, &["o-3"], ItemStatus::PendingCollection);
        disabled.remote_enabled = false;
        world.store.save_batch(&mut disabled).expect("save");
        world.seed(BatchStatus::AwaitingShipment, &["o-4"], ItemStatus::DownloadCompleted);

        let results = run_ready(&world.pipeline(), Stage::Collection).expect("run");

        let ids: Vec<_> = results.iter().map(|r| r.batch_id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(world.batch(disabled.id).status, BatchStatus::Open);
    }

    #[test]
    fn run_ready_with_nothing_waiting_is_empty() {
        let world = World::new(&[]);
        let results = run_ready(&world.pipeline(), Stage::Shipment).expect("run");
        assert!(results.is_empty());
    }
}
