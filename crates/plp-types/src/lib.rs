//! Core domain types for the PLP posting-batch pipeline.
//!
//! This crate provides the batch and item records, their closed status
//! enums, the carrier declaration schema, host order types, stage results
//! and the audit event types shared across the workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a posting batch.
pub type BatchId = u64;

/// Identifier of an item (an order enrolled in a batch).
pub type ItemId = u64;

/// Error returned when a status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

impl ParseStatusError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Declares a closed, string-backed status enum with `as_str`, `Display`,
/// `FromStr` and an `ALL` table.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable wire name of this variant.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseStatusError::new($kind, other)),
                }
            }
        }
    };
}

string_enum! {
    /// Batch-level state machine.
    BatchStatus, "batch status" {
        /// Accepting enrollments; waiting for data collection.
        Open => "open",
        /// Collection running, or finished and ready for submission.
        CollectingData => "collecting_data",
        /// Submission to the carrier in progress.
        InCommunication => "in_communication",
        /// Submitted; waiting for label receipts to be requested.
        RequestingReceipt => "requesting_receipt",
        /// Label request in progress.
        RequestingFileCreation => "requesting_file_creation",
        /// Receipts issued; labels are being polled for.
        RequestingShipmentCreation => "requesting_shipment_creation",
        /// Label download in progress.
        DownloadingLabels => "downloading_labels",
        /// Labels downloaded; waiting for shipment registration.
        AwaitingShipment => "awaiting_shipment",
        /// Shipment registration in progress.
        CreatingShipments => "creating_shipments",
        /// Terminal.
        Completed => "completed",
    }
}

impl BatchStatus {
    /// Whether the batch has data living on the carrier side. Such batches
    /// must never be deleted.
    pub fn is_remote_processing(self) -> bool {
        !matches!(self, BatchStatus::Open | BatchStatus::CollectingData)
    }

    /// Whether this status is only held while a stage operation runs.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            BatchStatus::InCommunication
                | BatchStatus::RequestingFileCreation
                | BatchStatus::DownloadingLabels
                | BatchStatus::CreatingShipments
        )
    }
}

string_enum! {
    /// Item-level state machine, independent of the batch status.
    ItemStatus, "item status" {
        PendingCollection => "pending_collection",
        ProcessingCollection => "processing_collection",
        CollectionCompleted => "collection_completed",
        /// Data collection failed.
        Error => "error",
        ProcessingSubmit => "processing_submit",
        SubmitCreated => "submit_created",
        SubmitError => "submit_error",
        PendingRequestLabels => "pending_request_labels",
        ProcessingRequestLabels => "processing_request_labels",
        ReceiptCreated => "receipt_created",
        ReceiptCreationError => "receipt_creation_error",
        PendingDownload => "pending_download",
        ProcessingDownload => "processing_download",
        DownloadCompleted => "download_completed",
        DownloadError => "download_error",
        ProcessingShipCreate => "processing_ship_create",
        ShipCreated => "ship_created",
        ShipCreateError => "ship_create_error",
    }
}

string_enum! {
    /// The five pipeline stages.
    Stage, "stage" {
        Collection => "collection",
        Submission => "submission",
        LabelRequest => "label_request",
        LabelDownload => "label_download",
        Shipment => "shipment",
    }
}

/// Which item status axis an eligibility filter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    /// The current status.
    #[default]
    Status,
    /// The status held before the most recent transition.
    PreviousStatus,
}

/// Error classification attached to failed remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Error is transient; the next invocation will likely succeed
    #[default]
    Retryable,
    /// Outcome is unknown (the remote side may have applied the call)
    Ambiguous,
    /// The request was rejected and needs fixing before a retry
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Ambiguous => write!(f, "ambiguous"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// A posting batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// Owning scope (store, warehouse, tenant).
    pub scope_id: String,
    pub status: BatchStatus,
    /// Batches with this flag off are skipped by the orchestrators.
    pub remote_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped by every successful save.
    #[serde(default)]
    pub version: u64,
}

impl Batch {
    /// A fresh, empty batch in `Open`.
    pub fn new(id: BatchId, scope_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            scope_id: scope_id.into(),
            status: BatchStatus::Open,
            remote_enabled: true,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn set_status(&mut self, status: BatchStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Marker left on an item whose label the carrier is still generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub since: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub checks: u32,
}

/// Carrier identifiers accumulated on an item as it moves through the stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronizing: Option<SyncMarker>,
}

impl ProcessingData {
    /// Record another "still synchronizing" answer, keeping the first timestamp.
    pub fn mark_synchronizing(&mut self, now: DateTime<Utc>) {
        match self.synchronizing.as_mut() {
            Some(marker) => {
                marker.last_checked = now;
                marker.checks += 1;
            }
            None => {
                self.synchronizing = Some(SyncMarker {
                    since: now,
                    last_checked: now,
                    checks: 1,
                })
            }
        }
    }
}

/// One order enrolled in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub batch_id: BatchId,
    pub order_ref: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Serialized carrier declaration produced by data collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_data: Option<serde_json::Value>,
    #[serde(default)]
    pub processing_data: ProcessingData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipment_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ItemRecord {
    /// A freshly enrolled item waiting for data collection.
    pub fn new(id: ItemId, batch_id: BatchId, order_ref: impl Into<String>) -> Self {
        Self {
            id,
            batch_id,
            order_ref: order_ref.into(),
            status: ItemStatus::PendingCollection,
            previous_status: None,
            error_message: None,
            collected_data: None,
            processing_data: ProcessingData::default(),
            shipment_ref: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `status`, remembering the one we leave.
    pub fn transition(&mut self, status: ItemStatus) {
        if self.status != status {
            self.previous_status = Some(self.status);
        }
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Move to a failure status and keep the reason.
    pub fn fail(&mut self, status: ItemStatus, message: impl Into<String>) {
        self.transition(status);
        self.error_message = Some(message.into());
    }

    /// Value of the requested status axis.
    pub fn status_on(&self, field: StatusField) -> Option<ItemStatus> {
        match field {
            StatusField::Status => Some(self.status),
            StatusField::PreviousStatus => self.previous_status,
        }
    }
}

/// Postal address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complement: Option<String>,
    #[serde(default)]
    pub district: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "BR".to_string()
}

/// Sender or recipient of a shipment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub address: Address,
}

/// One line of a host order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_grams: Option<u32>,
}

/// Monetary totals of a host order, in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub items_cents: u64,
    pub shipping_cents: u64,
    pub grand_total_cents: u64,
}

/// Order as exposed by the host order source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_ref: String,
    pub recipient: Party,
    pub lines: Vec<OrderLine>,
    /// Total weight as recorded by the host, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_grams: Option<u32>,
    pub totals: OrderTotals,
}

/// Physical package chosen for a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDims {
    /// Name of the package rule that was selected.
    pub profile: String,
    pub weight_grams: u32,
    pub height_cm: u32,
    pub width_cm: u32,
    pub length_cm: u32,
}

/// One entry of the content manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLine {
    pub description: String,
    pub quantity: u32,
    pub unit_value_cents: u64,
}

/// Additional carrier services requested for a shipment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_value_cents: Option<u64>,
    #[serde(default)]
    pub receipt_notice: bool,
    #[serde(default)]
    pub own_hands: bool,
}

/// Carrier declaration for a single order, as submitted to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub order_ref: String,
    pub service_code: String,
    pub sender: Party,
    pub recipient: Party,
    pub package: PackageDims,
    pub items: Vec<ManifestLine>,
    #[serde(default)]
    pub services: AdditionalServices,
}

/// Structured outcome of one stage invocation on one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub batch_id: BatchId,
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub errors: usize,
    pub synchronizing: usize,
    /// Batch status after the invocation; `None` when the batch was not found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    /// Stage-specific payload: tracking codes, receipt ids, label files or
    /// shipment references produced during this run.
    #[serde(default)]
    pub data: Vec<String>,
}

impl StageResult {
    /// A failed result that did not process anything.
    pub fn failed(
        stage: Stage,
        batch_id: BatchId,
        status: Option<BatchStatus>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            batch_id,
            success: false,
            message: message.into(),
            processed: 0,
            errors: 0,
            synchronizing: 0,
            status,
            data: Vec::new(),
        }
    }
}

/// Event types for the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    StageStarted {
        stage: Stage,
        from: BatchStatus,
    },
    ItemSucceeded {
        stage: Stage,
        status: ItemStatus,
    },
    ItemFailed {
        stage: Stage,
        class: ErrorClass,
        message: String,
    },
    ItemSynchronizing {
        checks: u32,
    },
    ItemsRecovered {
        stage: Stage,
        count: usize,
    },
    StageFinished {
        stage: Stage,
        status: BatchStatus,
        processed: usize,
        errors: usize,
        synchronizing: usize,
    },
    StageAborted {
        stage: Stage,
        status: BatchStatus,
        message: String,
    },
    StatusOverridden {
        from: BatchStatus,
        to: BatchStatus,
    },
}

/// A pipeline event for the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub batch_id: BatchId,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Order this event relates to, absent for batch-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
}

impl PipelineEvent {
    pub fn batch(batch_id: BatchId, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            batch_id,
            event_type,
            order_ref: None,
        }
    }

    pub fn item(batch_id: BatchId, order_ref: &str, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            batch_id,
            event_type,
            order_ref: Some(order_ref.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn error_class_display() {
        assert_eq!(ErrorClass::Retryable.to_string(), "retryable");
        assert_eq!(ErrorClass::Ambiguous.to_string(), "ambiguous");
        assert_eq!(ErrorClass::Permanent.to_string(), "permanent");
    }

    #[test]
    fn batch_status_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&BatchStatus::RequestingShipmentCreation).unwrap();
        assert_eq!(json, "\"requesting_shipment_creation\"");
        assert_eq!(
            "collecting_data".parse::<BatchStatus>().unwrap(),
            BatchStatus::CollectingData
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "shipped".parse::<ItemStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown item status: shipped");
        assert!(serde_json::from_str::<BatchStatus>("\"limbo\"").is_err());
    }

    #[test]
    fn remote_processing_excludes_local_statuses() {
        assert!(!BatchStatus::Open.is_remote_processing());
        assert!(!BatchStatus::CollectingData.is_remote_processing());
        assert!(BatchStatus::InCommunication.is_remote_processing());
        assert!(BatchStatus::Completed.is_remote_processing());
    }

    #[test]
    fn in_progress_statuses_are_distinct_per_stage() {
        let in_progress: Vec<_> = BatchStatus::ALL
            .iter()
            .filter(|s| s.is_in_progress())
            .collect();
        assert_eq!(in_progress.len(), 4);
        assert!(!BatchStatus::RequestingShipmentCreation.is_in_progress());
    }

    #[test]
    fn transition_tracks_previous_status() {
        let mut item = ItemRecord::new(1, 7, "order-1");
        assert_eq!(item.status_on(StatusField::PreviousStatus), None);

        item.transition(ItemStatus::ProcessingCollection);
        item.fail(ItemStatus::Error, "address missing");

        assert_eq!(item.status, ItemStatus::Error);
        assert_eq!(
            item.status_on(StatusField::PreviousStatus),
            Some(ItemStatus::ProcessingCollection)
        );
        assert_eq!(item.error_message.as_deref(), Some("address missing"));
    }

    #[test]
    fn transition_to_same_status_keeps_previous() {
        let mut item = ItemRecord::new(1, 7, "order-1");
        item.transition(ItemStatus::CollectionCompleted);
        item.transition(ItemStatus::CollectionCompleted);
        assert_eq!(item.previous_status, Some(ItemStatus::PendingCollection));
    }

    #[test]
    fn mark_synchronizing_keeps_first_timestamp() {
        let mut data = ProcessingData::default();
        let first = Utc::now() - chrono::Duration::minutes(5);
        data.mark_synchronizing(first);
        data.mark_synchronizing(Utc::now());

        let marker = data.synchronizing.expect("marker");
        assert_eq!(marker.since, first);
        assert_eq!(marker.checks, 2);
        assert!(marker.last_checked > first);
    }

    #[test]
    fn processing_data_omits_empty_fields() {
        let data = ProcessingData {
            tracking_code: Some("AA123456789BR".to_string()),
            ..ProcessingData::default()
        };
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"{"tracking_code":"AA123456789BR"}"#);
    }

    #[test]
    fn item_record_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": 3,
            "batch_id": 1,
            "order_ref": "o-3",
            "status": "submit_created",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let item: ItemRecord = serde_json::from_str(json).unwrap();
        assert_eq!(item.status, ItemStatus::SubmitCreated);
        assert_eq!(item.processing_data, ProcessingData::default());
    }

    #[test]
    fn event_type_serialization() {
        let event = PipelineEvent::item(
            4,
            "o-1",
            EventType::ItemFailed {
                stage: Stage::Submission,
                class: ErrorClass::Permanent,
                message: "rejected".to_string(),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"item_failed\""));
        assert!(json.contains("\"stage\":\"submission\""));
        assert!(json.contains("\"order_ref\":\"o-1\""));

        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    proptest! {
        #[test]
        fn batch_status_text_roundtrips(idx in 0usize..BatchStatus::ALL.len()) {
            let status = BatchStatus::ALL[idx];
            prop_assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }

        #[test]
        fn item_status_text_roundtrips(idx in 0usize..ItemStatus::ALL.len()) {
            let status = ItemStatus::ALL[idx];
            let json = serde_json::to_string(&status).unwrap();
            prop_assert_eq!(json, format!("\"{}\"", status.as_str()));
            prop_assert_eq!(status.to_string().parse::<ItemStatus>().unwrap(), status);
        }
    }
}
