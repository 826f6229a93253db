//! Shared plumbing for the HTTP adapters.

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::{GatewayError, HttpSettings};

/// Longest remote error text carried into an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    base: Url,
    token: Option<String>,
    http: Client,
}

impl ApiClient {
    pub(crate) fn new(settings: &HttpSettings) -> Result<Self, GatewayError> {
        let base = Url::parse(&settings.api_base).map_err(|e| {
            GatewayError::InvalidRequest(format!("invalid api_base {}: {e}", settings.api_base))
        })?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::InvalidRequest(format!(
                "api_base {} cannot carry a path",
                settings.api_base
            )));
        }

        let http = Client::builder()
            .user_agent(format!("plp/{}", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            base,
            token: settings.token.clone(),
            http,
        })
    }

    /// `base` with `segments` appended, each one percent-encoded.
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                GatewayError::InvalidRequest(format!("api_base {} cannot carry a path", self.base))
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    pub(crate) fn get(&self, segments: &[&str]) -> Result<RequestBuilder, GatewayError> {
        Ok(self.authorize(self.http.get(self.url(segments)?)))
    }

    pub(crate) fn post(&self, segments: &[&str]) -> Result<RequestBuilder, GatewayError> {
        Ok(self.authorize(self.http.post(self.url(segments)?)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turn a non-success response into [`GatewayError::Rejected`].
pub(crate) fn ensure_success(resp: Response) -> Result<Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(GatewayError::Rejected {
        status: status.as_u16(),
        message: error_message(&body, status.canonical_reason().unwrap_or("error")),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T, GatewayError> {
    let body = resp.text()?;
    serde_json::from_str(&body).map_err(|e| GatewayError::Decode(format!("{what}: {e}")))
}

/// Pull a human-readable message out of an error body.
///
/// Accepts `{"message": ..}`, `{"error": ..}` and
/// `{"errors": [{"message": ..}, ..]}`; anything else is used verbatim.
pub(crate) fn error_message(body: &str, fallback: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value.get("message").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("error").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(list) = value.get("errors").and_then(|v| v.as_array()) {
            let joined: Vec<_> = list
                .iter()
                .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                .collect();
            if !joined.is_empty() {
                return joined.join("; ");
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
