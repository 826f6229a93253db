//! Narrow interfaces to the outside world.
//!
//! The pipeline reaches the carrier through [`CarrierGateway`], the host
//! system's orders through [`OrderSource`] and its shipment/tracking
//! subsystem through [`ShipmentSubsystem`]. HTTP implementations of all three
//! ship with the crate ([`HttpCarrierGateway`], [`HttpHost`]); tests and
//! embedders plug in their own.

use std::time::Duration;

use plp_types::{Declaration, ErrorClass, Order};
use serde::{Deserialize, Serialize};

mod carrier;
mod http;
mod host;

pub use carrier::HttpCarrierGateway;
pub use host::HttpHost;

/// Errors returned by gateway calls.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request never produced an HTTP response (connect, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote side answered with a non-success status.
    #[error("rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// A success response whose body could not be understood.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The caller passed something the gateway cannot send.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The remote system is reachable but not serving this call right now.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// How a caller should treat this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Transport(e) if e.is_timeout() => ErrorClass::Ambiguous,
            GatewayError::Transport(_) | GatewayError::Unavailable(_) => ErrorClass::Retryable,
            GatewayError::Rejected { status, .. } => match *status {
                408 | 425 | 429 => ErrorClass::Retryable,
                400..=499 => ErrorClass::Permanent,
                _ => ErrorClass::Retryable,
            },
            // The remote side accepted the call; we just could not read the answer.
            GatewayError::Decode(_) => ErrorClass::Ambiguous,
            GatewayError::InvalidRequest(_) => ErrorClass::Permanent,
        }
    }
}

/// Identifiers returned by the carrier for a submitted declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub external_id: String,
    pub tracking_code: String,
}

/// Handle to an asynchronous label generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelReceipt {
    pub receipt_id: String,
}

/// A generated label document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelArtifact {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Answer to a label download poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelDownload {
    Ready(LabelArtifact),
    /// The carrier is still generating the label; poll again later.
    Synchronizing,
}

/// Carrier API.
pub trait CarrierGateway {
    /// Submit a single-item declaration.
    fn submit(&self, declaration: &Declaration) -> Result<Submission, GatewayError>;

    /// Ask the carrier to start generating the label for `tracking_code`.
    fn request_label(&self, tracking_code: &str) -> Result<LabelReceipt, GatewayError>;

    /// Poll for the label behind `receipt_id`.
    fn download_label(&self, receipt_id: &str) -> Result<LabelDownload, GatewayError>;
}

/// Host order data.
pub trait OrderSource {
    fn get_order(&self, order_ref: &str) -> Result<Order, GatewayError>;
}

/// Shipment record handed to the host shipment subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub order_ref: String,
    pub tracking_code: String,
    pub label_file: String,
    pub service_code: String,
}

/// Host shipment/tracking subsystem.
pub trait ShipmentSubsystem {
    fn is_shippable(&self, order_ref: &str) -> Result<bool, GatewayError>;

    /// Register a shipment and return the host's reference for it.
    fn register_shipment(&self, record: &ShipmentRecord) -> Result<String, GatewayError>;

    /// Tell the customer the order shipped. Callers treat failures as
    /// non-fatal.
    fn notify(&self, shipment_ref: &str) -> Result<(), GatewayError>;
}

/// Connection settings shared by the HTTP adapters.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub api_base: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HttpSettings {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
