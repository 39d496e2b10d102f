//! Page-side caller for the same-origin fallback proxy.

use std::time::Instant;

use tracing::Instrument;

use crate::error::InterceptError;
use crate::protocol::{ProxyEnvelope, RequestDescriptor};

/// Client for `POST /api/proxy`, used whenever the extension path is
/// unavailable or fails.
#[derive(Clone)]
pub struct FallbackProxy {
    http: reqwest::Client,
    base_url: String,
}

impl FallbackProxy {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Perform the request server-side and return the normalized envelope.
    ///
    /// The endpoint's fixed `{ "error": ... }` failure shape is surfaced as
    /// [`InterceptError::Proxy`]; a proxied upstream error status is a
    /// normal envelope, not an error.
    pub async fn forward(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ProxyEnvelope, InterceptError> {
        let span = quefork_tracing::proxy_fallback_span!(&descriptor.method, &descriptor.url);
        async {
            let start = Instant::now();
            let response = self
                .http
                .post(format!("{}/api/proxy", self.base_url))
                .json(descriptor)
                .send()
                .await?;
            tracing::Span::current().record("status", response.status().as_u16());

            let value: serde_json::Value = response.json().await?;
            tracing::Span::current()
                .record("latency_ms", start.elapsed().as_millis() as u64);

            if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                return Err(InterceptError::Proxy(error.to_string()));
            }
            serde_json::from_value(value).map_err(|e| InterceptError::Proxy(e.to_string()))
        }
        .instrument(span)
        .await
    }
}
