//! # PLP
//!
//! A resumable posting-batch pipeline: host orders are grouped into batches
//! and pushed through a carrier in five stages.
//!
//! ## Pipeline
//!
//! **collection → submission → label request → label download → shipment**
//!
//! 1. [`stages::DataCollection`] fetches each order from the host and builds
//!    its carrier [`Declaration`](plp_types::Declaration).
//! 2. [`stages::Submission`] submits declarations and stores tracking codes.
//! 3. [`stages::LabelRequest`] asks the carrier to generate labels.
//! 4. [`stages::LabelDownload`] polls for the labels; a label still being
//!    generated is not an error and is polled again on the next run.
//! 5. [`stages::ShipmentCreation`] registers host shipments and notifies
//!    customers.
//!
//! Every stage runs through [`engine::run_stage`]: one failing item never
//! stops the others, a crash never leaves a batch in an in-progress status,
//! and re-running a stage only touches items that are still eligible.
//!
//! ## Example
//!
//! ```ignore
//! use plp::{engine::Pipeline, labels::FsLabelArchive, orchestrator::{Chain, run_chain}};
//! use plp_store::FileStore;
//!
//! let opts = plp_config::RuntimeOptions::default();
//! let store = FileStore::new(opts.store_dir());
//! let labels = FsLabelArchive::new(opts.labels_dir());
//! let pipeline = Pipeline::new(&store, &carrier, &host, &host, &labels, &opts);
//! let report = run_chain(&pipeline, Chain::Full, None)?;
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: Stage template, item isolation and failure recovery
//! - [`stages`]: The five stage operations
//! - [`orchestrator`]: Early, late and full stage chains
//! - [`admin`]: Batch creation, enrollment, overrides and retries
//! - [`declaration`]: Carrier declaration formatting and package selection
//! - [`labels`]: Label archive

/// Batch creation, enrollment, overrides and retries.
pub mod admin;

/// Carrier declaration formatting and package selection.
pub mod declaration;

/// Stage template, item isolation and failure recovery.
pub mod engine;

/// Label archive.
pub mod labels;

/// Early, late and full stage chains.
pub mod orchestrator;

/// The five stage operations.
pub mod stages;

pub use plp_config as config;
pub use plp_events as events;
pub use plp_gateway as gateway;
pub use plp_lock as lock;
pub use plp_store as store;
pub use plp_types as types;
