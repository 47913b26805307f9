//! Outbound client for the external trigger service.
//!
//! A macro invocation becomes a single `GET {base}/{device_id}/{action}`
//! with the macro's stored params flattened into the query string. The call
//! is one-shot: whatever status and body the trigger service returns is
//! handed back verbatim, and transport failures surface as `Upstream`
//! errors. No retries, no response interpretation.

use crate::error::{Error, Result};
use std::time::Duration;

/// Verbatim upstream response, ready to be relayed to the caller.
#[derive(Debug, Clone)]
pub struct TriggerResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// HTTP client for the trigger service.
pub struct TriggerClient {
    base_url: String,
    http: reqwest::Client,
}

impl TriggerClient {
    /// Create a new client. The timeout bounds the whole outbound call.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, http })
    }

    /// Fire a macro: `GET {base}/{device_id}/{action}?<params>`.
    pub async fn fire(
        &self,
        device_id: &str,
        action: &str,
        params: Option<&serde_json::Value>,
    ) -> Result<TriggerResponse> {
        let url = format!("{}/{}/{}", self.base_url, device_id, action);
        let query = params.map(flatten_params).unwrap_or_default();

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?
            .to_vec();

        Ok(TriggerResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Flatten a stored params document into query-string pairs. Only top-level
/// object entries produce pairs; strings go through raw, everything else as
/// its compact JSON form.
fn flatten_params(params: &serde_json::Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}
