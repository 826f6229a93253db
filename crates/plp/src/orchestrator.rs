//! Stage chains.
//!
//! An orchestrator runs a fixed sequence of stages over every batch that is
//! ready for one of them (or over a single batch). Each batch advances as far
//! as it can in one pass; a stage that does not reach its success status
//! stops the chain for that batch until the next invocation.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use plp_types::{BatchId, BatchStatus, Stage, StageResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::Pipeline;
use crate::stages;

/// A named sequence of stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    /// Collection and submission
    Early,
    /// Label request, label download and shipment creation
    Late,
    /// All five stages
    Full,
}

impl Chain {
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Chain::Early => &[Stage::Collection, Stage::Submission],
            Chain::Late => &[Stage::LabelRequest, Stage::LabelDownload, Stage::Shipment],
            Chain::Full => Stage::ALL,
        }
    }

    /// Batch statuses from which some stage of the chain can start.
    pub fn entry_statuses(self) -> Vec<BatchStatus> {
        self.stages()
            .iter()
            .map(|stage| stages::operation(*stage).config().required_status)
            .collect()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Early => write!(f, "early"),
            Chain::Late => write!(f, "late"),
            Chain::Full => write!(f, "full"),
        }
    }
}

impl FromStr for Chain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "early" => Ok(Chain::Early),
            "late" => Ok(Chain::Late),
            "full" => Ok(Chain::Full),
            other => bail!("unknown chain: {other} (expected early, late or full)"),
        }
    }
}

/// What a chain did to one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    /// Why the batch was not touched at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub results: Vec<StageResult>,
}

impl BatchReport {
    fn skipped(batch_id: BatchId, reason: impl Into<String>) -> Self {
        Self {
            batch_id,
            skipped: Some(reason.into()),
            results: Vec::new(),
        }
    }

    /// No stage reported an error and the batch was not skipped.
    pub fn success(&self) -> bool {
        self.skipped.is_none() && self.results.iter().all(|r| r.success)
    }
}

/// Outcome of one chain invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub chain: Chain,
    pub batches: Vec<BatchReport>,
}

impl ChainReport {
    pub fn success(&self) -> bool {
        self.batches.iter().all(BatchReport::success)
    }

    /// One line per batch, for humans.
    pub fn summary(&self) -> String {
        if self.batches.is_empty() {
            return format!("{} chain: no eligible batches", self.chain);
        }
        self.batches
            .iter()
            .map(|report| match (&report.skipped, report.results.last()) {
                (Some(reason), _) => format!("batch {}: skipped ({reason})", report.batch_id),
                (None, Some(last)) => format!(
                    "batch {}: {} stage(s) run, last {} -> {}: {}",
                    report.batch_id,
                    report.results.len(),
                    last.stage,
                    last.status.map_or("unknown", BatchStatus::as_str),
                    last.message
                ),
                (None, None) => format!("batch {}: nothing to do", report.batch_id),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run `chain` over `batch_id`, or over every remote-enabled batch ready for
/// one of its stages. Only a failure to list batches is an error; per-batch
/// failures are reported in the [`ChainReport`].
///
/// Disabled batches are left out of the selection, so a scheduled pass over
/// them reports success. Naming a disabled batch explicitly reports it as
/// skipped.
pub fn run_chain(pipeline: &Pipeline<'_>, chain: Chain, batch_id: Option<BatchId>) -> Result<ChainReport> {
    let batch_ids: Vec<BatchId> = match batch_id {
        Some(id) => vec![id],
        None => {
            let (enabled, disabled): (Vec<_>, Vec<_>) = pipeline
                .store
                .batches_by_status(&chain.entry_statuses())
                .context("failed to list batches")?
                .into_iter()
                .partition(|batch| batch.remote_enabled);
            if !disabled.is_empty() {
                debug!(%chain, disabled = disabled.len(), "leaving disabled batches alone");
            }
            enabled.into_iter().map(|batch| batch.id).collect()
        }
    };
    info!(%chain, batches = batch_ids.len(), "chain started");

    let batches = batch_ids
        .into_iter()
        .map(|id| run_batch(pipeline, chain, id))
        .collect();
    Ok(ChainReport { chain, batches })
}

fn run_batch(pipeline: &Pipeline<'_>, chain: Chain, batch_id: BatchId) -> BatchReport {
    let mut report = BatchReport {
        batch_id,
        skipped: None,
        results: Vec::new(),
    };

    for &stage in chain.stages() {
        let config = stages::operation(stage).config();
        let batch = match pipeline.store.load_batch(batch_id) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                warn!(batch_id, "batch not found");
                return BatchReport::skipped(batch_id, "batch not found");
            }
            Err(e) => {
                warn!(batch_id, "failed to load batch: {e}");
                return BatchReport::skipped(batch_id, format!("failed to load batch: {e}"));
            }
        };
        if !batch.remote_enabled {
            info!(batch_id, "remote processing disabled; skipping");
            return BatchReport::skipped(batch_id, "remote processing disabled");
        }
        if batch.status != config.required_status {
            continue;
        }

        let result = stages::run(pipeline, stage, batch_id);
        let advanced = result.status == Some(config.success_status);
        report.results.push(result);
        if !advanced {
            info!(batch_id, %stage, "stage did not complete; chain stops for this batch");
            break;
        }
    }

    if report.results.is_empty() {
        report.skipped = Some("no stage of this chain applies".to_string());
    }
    report
}
