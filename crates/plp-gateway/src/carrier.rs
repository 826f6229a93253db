use base64::Engine;
use plp_types::Declaration;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{ApiClient, decode, ensure_success};
use crate::{
    CarrierGateway, GatewayError, HttpSettings, LabelArtifact, LabelDownload, LabelReceipt,
    Submission,
};

/// Carrier API over blocking HTTP.
///
/// Endpoints, relative to `api_base`:
///
/// - `POST v1/declarations` with a [`Declaration`] body
/// - `POST v1/labels` with `{"tracking_codes": [..]}`
/// - `GET v1/labels/{receipt_id}`; `202 Accepted` or `"status": "synchronizing"`
///   means the label is not ready yet
#[derive(Debug, Clone)]
pub struct HttpCarrierGateway {
    api: ApiClient,
}

#[derive(Debug, Serialize)]
struct LabelRequest<'a> {
    tracking_codes: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LabelState {
    Ready,
    Synchronizing,
    Failed,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    status: LabelState,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpCarrierGateway {
    pub fn new(settings: &HttpSettings) -> Result<Self, GatewayError> {
        Ok(Self {
            api: ApiClient::new(settings)?,
        })
    }
}

impl CarrierGateway for HttpCarrierGateway {
    fn submit(&self, declaration: &Declaration) -> Result<Submission, GatewayError> {
        debug!(order_ref = %declaration.order_ref, "submitting declaration");
        let resp = self.api.post(&["v1", "declarations"])?.json(declaration).send()?;
        let submission: Submission = decode(ensure_success(resp)?, "declaration response")?;
        if submission.tracking_code.trim().is_empty() {
            return Err(GatewayError::Decode(
                "declaration response carries no tracking code".to_string(),
            ));
        }
        Ok(submission)
    }

    fn request_label(&self, tracking_code: &str) -> Result<LabelReceipt, GatewayError> {
        if tracking_code.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("empty tracking code".to_string()));
        }
        let body = LabelRequest {
            tracking_codes: [tracking_code],
        };
        let resp = self.api.post(&["v1", "labels"])?.json(&body).send()?;
        decode(ensure_success(resp)?, "label receipt")
    }

    fn download_label(&self, receipt_id: &str) -> Result<LabelDownload, GatewayError> {
        let resp = self.api.get(&["v1", "labels", receipt_id])?.send()?;
        if resp.status() == StatusCode::ACCEPTED {
            return Ok(LabelDownload::Synchronizing);
        }
        let label: LabelResponse = decode(ensure_success(resp)?, "label response")?;

        match label.status {
            LabelState::Synchronizing => Ok(LabelDownload::Synchronizing),
            LabelState::Failed => Err(GatewayError::Unavailable(
                label
                    .message
                    .unwrap_or_else(|| format!("label generation failed for receipt {receipt_id}")),
            )),
            LabelState::Ready => {
                let encoded = label.content_base64.ok_or_else(|| {
                    GatewayError::Decode("ready label carries no content".to_string())
                })?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| GatewayError::Decode(format!("label content: {e}")))?;
                Ok(LabelDownload::Ready(LabelArtifact {
                    file_name: label
                        .file_name
                        .unwrap_or_else(|| format!("{receipt_id}.pdf")),
                    content_type: label
                        .content_type
                        .unwrap_or_else(|| "application/pdf".to_string()),
                    bytes,
                }))
            }
        }
    }
}
