//! Stage execution template.
//!
//! Every stage follows the same run: validate the batch, take its lease,
//! move it to the stage's in-progress status, process each eligible item in
//! isolation, then let the stage decide the batch's final status. Stages
//! only supply the per-item transformation and the completion policy.

use std::path::PathBuf;

use anyhow::{Context, Result};
use plp_config::RuntimeOptions;
use plp_events::{EventLog, events_path};
use plp_gateway::{CarrierGateway, GatewayError, OrderSource, ShipmentSubsystem};
use plp_lock::BatchLease;
use plp_store::{PlpStore, StoreError};
use plp_types::{
    Batch, BatchId, BatchStatus, ErrorClass, EventType, ItemId, ItemRecord, ItemStatus,
    PipelineEvent, Stage, StageResult, StatusField,
};
use tracing::{debug, error, info, info_span, warn};

use crate::declaration::DeclarationError;
use crate::labels::LabelArchive;

/// Everything a stage run needs from the outside world.
pub struct Pipeline<'a> {
    pub store: &'a dyn PlpStore,
    pub carrier: &'a dyn CarrierGateway,
    pub orders: &'a dyn OrderSource,
    pub shipments: &'a dyn ShipmentSubsystem,
    pub labels: &'a dyn LabelArchive,
    pub opts: &'a RuntimeOptions,
    /// Where batch leases live; `None` runs without leases.
    pub lock_dir: Option<PathBuf>,
    /// Audit log file; `None` keeps events in memory only.
    pub events_path: Option<PathBuf>,
}

impl<'a> Pipeline<'a> {
    /// A pipeline with leases and the event log under `opts.state_dir`.
    pub fn new(
        store: &'a dyn PlpStore,
        carrier: &'a dyn CarrierGateway,
        orders: &'a dyn OrderSource,
        shipments: &'a dyn ShipmentSubsystem,
        labels: &'a dyn LabelArchive,
        opts: &'a RuntimeOptions,
    ) -> Self {
        Self {
            store,
            carrier,
            orders,
            shipments,
            labels,
            opts,
            lock_dir: Some(opts.lock_dir()),
            events_path: Some(events_path(&opts.state_dir)),
        }
    }

    pub fn without_leases(mut self) -> Self {
        self.lock_dir = None;
        self
    }

    pub fn without_event_log(mut self) -> Self {
        self.events_path = None;
        self
    }

    fn flush_events(&self, events: &EventLog) {
        let Some(path) = &self.events_path else {
            return;
        };
        if let Err(e) = events.write_to_file(path) {
            warn!(path = %path.display(), "failed to append audit events: {e:#}");
        }
    }
}

/// Static description of a stage.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub stage: Stage,
    /// Batch status the stage expects to start from
    pub required_status: BatchStatus,
    /// Batch status held while the stage runs
    pub in_progress_status: BatchStatus,
    pub success_status: BatchStatus,
    pub failure_status: BatchStatus,
    /// Item statuses eligible for processing, read on `eligible_field`
    pub eligible: &'static [ItemStatus],
    pub eligible_field: StatusField,
    pub item_in_progress: ItemStatus,
    pub item_success: ItemStatus,
    pub item_failure: ItemStatus,
    /// Where an item goes when the remote side is still working on it
    pub item_synchronizing: Option<ItemStatus>,
    /// Refuse to run on a batch in the wrong status, whatever the config says
    pub strict_validation: bool,
}

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The item reached the stage's success status. `detail` is reported in
    /// [`StageResult::data`].
    Completed { detail: Option<String> },
    /// The remote side is not done yet; try again on a later run.
    Synchronizing,
}

impl ItemOutcome {
    pub fn completed(detail: impl Into<String>) -> Self {
        ItemOutcome::Completed {
            detail: Some(detail.into()),
        }
    }
}

/// An isolated per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ItemError {
    pub class: ErrorClass,
    pub message: String,
}

impl ItemError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ItemError {
    fn from(err: GatewayError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

impl From<DeclarationError> for ItemError {
    fn from(err: DeclarationError) -> Self {
        Self::permanent(err.to_string())
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub processed: usize,
    pub succeeded: usize,
    pub errors: usize,
    pub synchronizing: usize,
    /// Items that ended this run in the failure status
    pub failed_items: Vec<ItemId>,
    /// Items moved back to a re-entry status by the completion policy
    pub recovered: usize,
    pub data: Vec<String>,
}

/// A pipeline stage.
pub trait StageOperation {
    fn config(&self) -> StageConfig;

    /// Transform one item. The engine owns status transitions and
    /// persistence; the hook only fills in the item's data.
    fn process_item(
        &self,
        pipeline: &Pipeline<'_>,
        batch: &Batch,
        item: &mut ItemRecord,
    ) -> Result<ItemOutcome, ItemError>;

    /// Completion policy: the batch status after all items ran. May also
    /// repair item state, recording how many items it touched in
    /// `tally.recovered`.
    fn final_status(
        &self,
        pipeline: &Pipeline<'_>,
        batch: &Batch,
        tally: &mut Tally,
    ) -> Result<BatchStatus>;
}

/// Run `op` on `batch_id`. Never fails: every problem is reported in the
/// returned [`StageResult`].
pub fn run_stage(pipeline: &Pipeline<'_>, op: &dyn StageOperation, batch_id: BatchId) -> StageResult {
    let config = op.config();
    let span = info_span!("stage", stage = %config.stage, batch_id);
    let _entered = span.enter();

    let mut events = EventLog::new();
    let result = run_validated(pipeline, op, &config, batch_id, &mut events);
    pipeline.flush_events(&events);
    result
}

fn run_validated(
    pipeline: &Pipeline<'_>,
    op: &dyn StageOperation,
    config: &StageConfig,
    batch_id: BatchId,
    events: &mut EventLog,
) -> StageResult {
    let stage = config.stage;

    // The lease comes first: a snapshot loaded before it could already be
    // outdated by the run that held it.
    let _lease = match &pipeline.lock_dir {
        Some(dir) => match BatchLease::acquire_with_timeout(
            dir,
            batch_id,
            Some(stage),
            pipeline.opts.lock_timeout,
        ) {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!("{e:#}");
                let status = pipeline
                    .store
                    .load_batch(batch_id)
                    .ok()
                    .flatten()
                    .map(|b| b.status);
                return StageResult::failed(stage, batch_id, status, format!("{e:#}"));
            }
        },
        None => None,
    };

    let batch = match pipeline.store.load_batch(batch_id) {
        Ok(Some(batch)) => batch,
        Ok(None) => {
            warn!("batch not found");
            return StageResult::failed(stage, batch_id, None, format!("batch {batch_id} not found"));
        }
        Err(e) => {
            error!("failed to load batch: {e}");
            return StageResult::failed(
                stage,
                batch_id,
                None,
                format!("failed to load batch {batch_id}: {e}"),
            );
        }
    };

    if batch.status != config.required_status {
        let message = format!(
            "batch {batch_id} is {}, {stage} expects {}",
            batch.status, config.required_status
        );
        if config.strict_validation || pipeline.opts.strict_validation {
            warn!("{message}; refusing to run");
            return StageResult::failed(stage, batch_id, Some(batch.status), message);
        }
        warn!("{message}; continuing");
    }

    match execute(pipeline, op, config, batch, events) {
        Ok(result) => result,
        Err(e) => abort(pipeline, config, batch_id, &e, events),
    }
}

fn execute(
    pipeline: &Pipeline<'_>,
    op: &dyn StageOperation,
    config: &StageConfig,
    mut batch: Batch,
    events: &mut EventLog,
) -> Result<StageResult> {
    let stage = config.stage;
    let store = pipeline.store;

    let from = batch.status;
    batch.set_status(config.in_progress_status);
    store
        .save_batch(&mut batch)
        .context("failed to move batch to its in-progress status")?;
    events.record(PipelineEvent::batch(
        batch.id,
        EventType::StageStarted { stage, from },
    ));
    info!(from = %from, to = %config.in_progress_status, "stage started");

    let interrupted = fail_in_progress(
        pipeline,
        config,
        batch.id,
        &format!("interrupted during an earlier {stage} run"),
        events,
    )?;
    if interrupted > 0 {
        warn!(count = interrupted, "items left in progress by an earlier run marked failed");
    }

    let items = store
        .items_by_status(batch.id, config.eligible, config.eligible_field)
        .context("failed to select eligible items")?;

    if items.is_empty() {
        info!("no eligible items");
        batch.set_status(config.failure_status);
        store
            .save_batch(&mut batch)
            .context("failed to save batch status")?;
        events.record(PipelineEvent::batch(
            batch.id,
            EventType::StageFinished {
                stage,
                status: batch.status,
                processed: 0,
                errors: 0,
                synchronizing: 0,
            },
        ));
        return Ok(StageResult::failed(
            stage,
            batch.id,
            Some(batch.status),
            "no eligible items",
        ));
    }

    let mut tally = Tally::default();
    for mut item in items {
        tally.processed += 1;
        item.transition(config.item_in_progress);
        store
            .save_item(&item)
            .with_context(|| format!("failed to mark item {} in progress", item.id))?;

        let outcome = op.process_item(pipeline, &batch, &mut item);
        record_outcome(config, &mut item, outcome, &mut tally, events);

        store
            .save_item(&item)
            .with_context(|| format!("failed to save item {}", item.id))?;
    }

    let final_status = op.final_status(pipeline, &batch, &mut tally)?;
    if tally.recovered > 0 {
        info!(count = tally.recovered, "items moved back for another pass");
        events.record(PipelineEvent::batch(
            batch.id,
            EventType::ItemsRecovered {
                stage,
                count: tally.recovered,
            },
        ));
    }

    batch.set_status(final_status);
    store
        .save_batch(&mut batch)
        .context("failed to save final batch status")?;
    events.record(PipelineEvent::batch(
        batch.id,
        EventType::StageFinished {
            stage,
            status: final_status,
            processed: tally.processed,
            errors: tally.errors,
            synchronizing: tally.synchronizing,
        },
    ));
    info!(
        status = %final_status,
        processed = tally.processed,
        errors = tally.errors,
        synchronizing = tally.synchronizing,
        "stage finished"
    );

    Ok(StageResult {
        stage,
        batch_id: batch.id,
        success: tally.errors == 0,
        message: summary_message(&tally),
        processed: tally.processed,
        errors: tally.errors,
        synchronizing: tally.synchronizing,
        status: Some(final_status),
        data: tally.data,
    })
}

fn record_outcome(
    config: &StageConfig,
    item: &mut ItemRecord,
    outcome: Result<ItemOutcome, ItemError>,
    tally: &mut Tally,
    events: &mut EventLog,
) {
    let stage = config.stage;
    let outcome = match (outcome, config.item_synchronizing) {
        (Ok(ItemOutcome::Synchronizing), None) => Err(ItemError::permanent(format!(
            "{stage} cannot leave an item synchronizing"
        ))),
        (other, _) => other,
    };

    match outcome {
        Ok(ItemOutcome::Completed { detail }) => {
            item.transition(config.item_success);
            item.error_message = None;
            tally.succeeded += 1;
            tally.data.extend(detail);
            debug!(item_id = item.id, order_ref = %item.order_ref, "item completed");
            events.record(PipelineEvent::item(
                item.batch_id,
                &item.order_ref,
                EventType::ItemSucceeded {
                    stage,
                    status: config.item_success,
                },
            ));
        }
        Ok(ItemOutcome::Synchronizing) => {
            if let Some(status) = config.item_synchronizing {
                item.transition(status);
            }
            tally.synchronizing += 1;
            let checks = item
                .processing_data
                .synchronizing
                .as_ref()
                .map_or(0, |marker| marker.checks);
            info!(item_id = item.id, order_ref = %item.order_ref, checks, "item still synchronizing");
            events.record(PipelineEvent::item(
                item.batch_id,
                &item.order_ref,
                EventType::ItemSynchronizing { checks },
            ));
        }
        Err(err) => {
            item.fail(config.item_failure, err.message.clone());
            tally.errors += 1;
            tally.failed_items.push(item.id);
            warn!(
                item_id = item.id,
                order_ref = %item.order_ref,
                class = %err.class,
                "item failed: {}",
                err.message
            );
            events.record(PipelineEvent::item(
                item.batch_id,
                &item.order_ref,
                EventType::ItemFailed {
                    stage,
                    class: err.class,
                    message: err.message,
                },
            ));
        }
    }
}

/// Force the batch out of its in-progress status after an unexpected error,
/// failing the items this run left half-processed.
///
/// A version conflict means another writer saved the batch after it was
/// loaded. That writer's status stands and nothing is rolled back.
fn abort(
    pipeline: &Pipeline<'_>,
    config: &StageConfig,
    batch_id: BatchId,
    err: &anyhow::Error,
    events: &mut EventLog,
) -> StageResult {
    let stage = config.stage;
    error!("stage aborted: {err:#}");
    let current_status = || {
        pipeline
            .store
            .load_batch(batch_id)
            .ok()
            .flatten()
            .map(|b| b.status)
    };

    let status = if is_conflict(err) {
        warn!("batch was saved by another writer; leaving its status alone");
        current_status()
    } else {
        let message = format!("{stage} aborted: {err:#}");
        if let Err(e) = fail_in_progress(pipeline, config, batch_id, &message, events) {
            error!("failed to release items left in progress: {e:#}");
        }
        match force_status(pipeline, batch_id, config.failure_status) {
            Ok(status) => Some(status),
            Err(e) => {
                error!("failed to move batch to {}: {e:#}", config.failure_status);
                current_status()
            }
        }
    };

    events.record(PipelineEvent::batch(
        batch_id,
        EventType::StageAborted {
            stage,
            status: status.unwrap_or(config.failure_status),
            message: format!("{err:#}"),
        },
    ));
    StageResult::failed(stage, batch_id, status, format!("{stage} aborted: {err:#}"))
}

fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::Conflict { .. })))
}

/// Move every item of `batch_id` still in the stage's in-progress status to
/// its failure status. Under the batch lease those items can only come from a
/// run that stopped between marking and saving them; whether their remote
/// call went through is unknown, so they are failed as ambiguous and left
/// for `retry_failed`.
fn fail_in_progress(
    pipeline: &Pipeline<'_>,
    config: &StageConfig,
    batch_id: BatchId,
    message: &str,
    events: &mut EventLog,
) -> Result<usize> {
    let stranded = pipeline
        .store
        .items_by_status(batch_id, &[config.item_in_progress], StatusField::Status)
        .context("failed to select items left in progress")?;
    for mut item in stranded.iter().cloned() {
        item.fail(config.item_failure, message);
        pipeline
            .store
            .save_item(&item)
            .with_context(|| format!("failed to save item {}", item.id))?;
        warn!(item_id = item.id, order_ref = %item.order_ref, "item left in progress marked failed");
        events.record(PipelineEvent::item(
            batch_id,
            &item.order_ref,
            EventType::ItemFailed {
                stage: config.stage,
                class: ErrorClass::Ambiguous,
                message: message.to_string(),
            },
        ));
    }
    Ok(stranded.len())
}

fn force_status(pipeline: &Pipeline<'_>, batch_id: BatchId, status: BatchStatus) -> Result<BatchStatus> {
    // Reload so a version bumped before the failure does not block the save.
    let mut batch = pipeline
        .store
        .load_batch(batch_id)?
        .with_context(|| format!("batch {batch_id} disappeared"))?;
    batch.set_status(status);
    pipeline.store.save_batch(&mut batch)?;
    Ok(status)
}

fn summary_message(tally: &Tally) -> String {
    let mut message = format!(
        "processed {} item(s), {} error(s)",
        tally.processed, tally.errors
    );
    if tally.synchronizing > 0 {
        message.push_str(&format!(
            "; {} label(s) still synchronizing; try again later",
            tally.synchronizing
        ));
    }
    message
}
