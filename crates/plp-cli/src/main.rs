mod endpoints;
mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use plp::admin::{Admin, BatchSummary};
use plp::config::{CONFIG_FILE, CliOverrides, PlpConfig, RuntimeOptions};
use plp::engine::Pipeline;
use plp::events::{EventLog, events_path};
use plp::labels::FsLabelArchive;
use plp::orchestrator::{Chain, ChainReport, run_chain};
use plp::stages;
use plp::store::FileStore;
use plp::types::{Batch, BatchId, BatchStatus, Stage, StageResult};

use crate::endpoints::{Carrier, Host, require_endpoints};

#[derive(Parser, Debug)]
#[command(name = "plp", version)]
#[command(about = "Resumable posting-batch pipeline: collect, submit, label and ship orders")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(clap::Args, Debug)]
struct GlobalArgs {
    /// Config file (default: ./plp.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the batch store, leases, labels and event log (default: .plp)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Refuse to run a stage on a batch in the wrong status.
    #[arg(long, global = true)]
    strict: bool,

    /// Age after which a batch lease is considered stale (e.g. 30m, 1h)
    #[arg(long, global = true)]
    lock_timeout: Option<String>,

    /// Carrier API base URL
    #[arg(long, global = true)]
    carrier_api: Option<String>,

    /// Carrier API token (default: $PLP_CARRIER_TOKEN)
    #[arg(long, global = true)]
    carrier_token: Option<String>,

    /// Host API base URL
    #[arg(long, global = true)]
    host_api: Option<String>,

    /// Do not notify customers when shipments are registered.
    #[arg(long, global = true)]
    no_notify: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter plp.toml.
    InitConfig {
        /// Destination (default: ./plp.toml)
        #[arg(long, default_value = CONFIG_FILE)]
        output: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Create an empty, open batch.
    CreateBatch {
        /// Owning scope (store, warehouse, tenant)
        scope: String,
    },
    /// Enroll host orders in an open batch.
    Enroll {
        batch: BatchId,
        #[arg(required = true)]
        orders: Vec<String>,
    },
    /// Run one stage on one batch, or on every batch waiting for it.
    Run {
        /// collection, submission, label_request, label_download or shipment
        stage: Stage,
        batch: Option<BatchId>,
    },
    /// Run a stage chain over every ready batch, or one batch.
    Orchestrate {
        /// early, late or full
        chain: Chain,
        #[arg(long)]
        batch: Option<BatchId>,
    },
    /// Show one batch in detail, or list all batches.
    Status { batch: Option<BatchId> },
    /// Put items that failed a stage back in line for it.
    RetryFailed { batch: BatchId, stage: Stage },
    /// Force a batch into a status.
    SetStatus { batch: BatchId, status: BatchStatus },
    /// Let orchestrators pick the batch up again.
    Enable { batch: BatchId },
    /// Keep orchestrators away from the batch.
    Disable { batch: BatchId },
    /// Delete a batch that never reached the carrier.
    Delete { batch: BatchId },
    /// Print the audit log.
    Events {
        #[arg(long)]
        batch: Option<BatchId>,
        #[arg(long)]
        order: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.global.log_level);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// `Ok(false)` means the command ran but reported failures.
fn run(cli: Cli) -> Result<bool> {
    let Cli { global, cmd } = cli;
    if let Commands::InitConfig { output, force } = &cmd {
        init_config(output, *force)?;
        return Ok(true);
    }

    let opts = load_options(&global)?;
    let store = FileStore::new(opts.store_dir());
    let admin = Admin::new(&store, &opts);
    let json = global.json;

    match cmd {
        Commands::InitConfig { .. } => {}
        Commands::CreateBatch { scope } => {
            let batch = admin.create_batch(&scope)?;
            emit(json, &batch, || format!("created batch {}", batch.id))?;
        }
        Commands::Enroll { batch, orders } => {
            for order_ref in &orders {
                let item = admin.enroll_order(batch, order_ref)?;
                emit(json, &item, || {
                    format!("enrolled {} in batch {batch} as item {}", item.order_ref, item.id)
                })?;
            }
        }
        Commands::Run { stage, batch } => {
            require_endpoints(&[stage], &opts)?;
            let carrier = Carrier::from_options(&opts)?;
            let host = Host::from_options(&opts)?;
            let labels = FsLabelArchive::new(opts.labels_dir());
            let pipeline = Pipeline::new(&store, &carrier, &host, &host, &labels, &opts);
            let results = match batch {
                Some(batch) => vec![stages::run(&pipeline, stage, batch)],
                None => stages::run_ready(&pipeline, stage)?,
            };
            emit(json, &results, || describe_results(stage, &results))?;
            return Ok(results.iter().all(|r| r.success));
        }
        Commands::Orchestrate { chain, batch } => {
            require_endpoints(chain.stages(), &opts)?;
            let carrier = Carrier::from_options(&opts)?;
            let host = Host::from_options(&opts)?;
            let labels = FsLabelArchive::new(opts.labels_dir());
            let pipeline = Pipeline::new(&store, &carrier, &host, &host, &labels, &opts);
            let report = run_chain(&pipeline, chain, batch)?;
            emit(json, &report, || describe_report(&report))?;
            return Ok(report.success());
        }
        Commands::Status { batch: Some(batch) } => {
            let summary = admin.batch_summary(batch)?;
            emit(json, &summary, || describe_summary(&summary))?;
        }
        Commands::Status { batch: None } => {
            let batches = admin.list_batches(None)?;
            emit(json, &batches, || describe_batches(&batches))?;
        }
        Commands::RetryFailed { batch, stage } => {
            let count = admin.retry_failed(batch, stage)?;
            emit(json, &serde_json::json!({ "batch_id": batch, "stage": stage, "retried": count }), || {
                format!("{count} item(s) queued for another {stage} pass")
            })?;
        }
        Commands::SetStatus { batch, status } => {
            let batch = admin.override_status(batch, status)?;
            emit(json, &batch, || format!("batch {} is now {}", batch.id, batch.status))?;
        }
        Commands::Enable { batch } => toggle_remote(&admin, json, batch, true)?,
        Commands::Disable { batch } => toggle_remote(&admin, json, batch, false)?,
        Commands::Delete { batch } => {
            admin.delete_batch(batch)?;
            emit(json, &serde_json::json!({ "deleted": batch }), || {
                format!("deleted batch {batch}")
            })?;
        }
        Commands::Events { batch, order } => {
            let log = EventLog::read_from_file(&events_path(&opts.state_dir))?;
            let events: Vec<_> = log
                .all_events()
                .iter()
                .filter(|e| batch.is_none_or(|id| e.batch_id == id))
                .filter(|e| order.as_deref().is_none_or(|o| e.order_ref.as_deref() == Some(o)))
                .collect();
            if json {
                for event in events {
                    println!("{}", serde_json::to_string(event)?);
                }
            } else {
                for event in events {
                    println!(
                        "{} batch {}{}: {}",
                        event.timestamp.to_rfc3339(),
                        event.batch_id,
                        event
                            .order_ref
                            .as_deref()
                            .map(|o| format!(" order {o}"))
                            .unwrap_or_default(),
                        serde_json::to_string(&event.event_type)?
                    );
                }
            }
        }
    }
    Ok(true)
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (pass --force to overwrite)", output.display());
    }
    fs::write(output, PlpConfig::default_toml_template())
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(())
}

fn toggle_remote(admin: &Admin<'_>, json: bool, batch_id: BatchId, enabled: bool) -> Result<()> {
    let batch = admin.set_remote_enabled(batch_id, enabled)?;
    emit(json, &batch, || {
        let state = if enabled { "enabled" } else { "disabled" };
        format!("remote processing {state} for batch {}", batch.id)
    })
}

fn load_options(cli: &GlobalArgs) -> Result<RuntimeOptions> {
    let config = match &cli.config {
        Some(path) => PlpConfig::load_from_file(path)?,
        None => PlpConfig::load_from_dir(Path::new("."))?.unwrap_or_default(),
    };
    config.validate().context("invalid configuration")?;

    let overrides = CliOverrides {
        state_dir: cli.state_dir.clone(),
        lock_timeout: cli.lock_timeout.as_deref().map(parse_duration).transpose()?,
        strict_validation: cli.strict,
        carrier_api_base: cli.carrier_api.clone(),
        carrier_token: cli.carrier_token.clone(),
        host_api_base: cli.host_api.clone(),
        no_notify: cli.no_notify,
    };
    let opts = config.build_runtime_options(overrides);
    debug!(
        state_dir = %opts.state_dir.display(),
        strict = opts.strict_validation,
        carrier = opts.carrier.api_base.is_some(),
        host = opts.host.api_base.is_some(),
        "options loaded"
    );
    Ok(opts)
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

/// Print `value` as JSON, or the text produced by `text`.
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn describe_result(result: &StageResult) -> String {
    let status = result.status.map_or("unknown", BatchStatus::as_str);
    let mut out = format!(
        "{} on batch {}: {} (status: {status})",
        result.stage, result.batch_id, result.message
    );
    for entry in &result.data {
        out.push_str(&format!("\n  {entry}"));
    }
    out
}

fn describe_results(stage: Stage, results: &[StageResult]) -> String {
    if results.is_empty() {
        return format!("{stage}: no batches waiting");
    }
    results.iter().map(describe_result).collect::<Vec<_>>().join("\n")
}

fn describe_report(report: &ChainReport) -> String {
    let mut out = report.summary();
    for batch in &report.batches {
        for result in &batch.results {
            out.push_str(&format!("\n  {}", describe_result(result)));
        }
    }
    out
}

fn describe_summary(summary: &BatchSummary) -> String {
    let batch = &summary.batch;
    let mut out = format!(
        "batch {} ({}): {}{}\nitems: {}",
        batch.id,
        batch.scope_id,
        batch.status,
        if batch.remote_enabled { "" } else { " [disabled]" },
        summary.items
    );
    for (status, count) in &summary.by_status {
        out.push_str(&format!("\n  {status}: {count}"));
    }
    for item in &summary.errors {
        out.push_str(&format!(
            "\n  ! {} ({}): {}",
            item.order_ref,
            item.status,
            item.error_message.as_deref().unwrap_or_default()
        ));
    }
    out
}

fn describe_batches(batches: &[Batch]) -> String {
    if batches.is_empty() {
        return "no batches".to_string();
    }
    batches
        .iter()
        .map(|b| {
            format!(
                "{:>5}  {:<30} {}{}",
                b.id,
                b.status.as_str(),
                b.scope_id,
                if b.remote_enabled { "" } else { " [disabled]" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
