//! Network execution of intercepted requests.
//!
//! One attempt per request: a failed fetch is a terminal local failure
//! reported as `{ success: false, error }`, never retried here. The page
//! side owns fallback policy.

use std::collections::HashMap;
use std::time::Instant;

use reqwest::Method;
use tracing::Instrument;

use crate::protocol::{ExecuteRequest, ExecuteResult, ResponseEnvelope};

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Execute an intercepted request against `target_url`, producing the
/// normalized response envelope the page consumes.
pub async fn execute(
    client: &reqwest::Client,
    request: &ExecuteRequest,
    target_url: &str,
    correlation_id: &str,
) -> ExecuteResult {
    let span = quefork_tracing::intercept_span!(correlation_id, &request.url);
    span.record("target", target_url);

    async {
        let destination = destination_url(target_url, &request.url);
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .unwrap_or(Method::GET);

        let mut builder = client.request(method.clone(), &destination);
        for (name, value) in &request.headers {
            if HOP_BY_HOP_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        // Body serialized as JSON unless the method is GET.
        if method != Method::GET {
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::Span::current().record("status", 0_u16);
                tracing::Span::current().record("latency_ms", start.elapsed().as_millis() as u64);
                tracing::warn!(error = %e, destination = %destination, "intercepted fetch failed");
                return ExecuteResult::err(e.to_string());
            }
        };

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let content_type = headers.get("content-type").cloned();

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::Span::current().record("status", status.as_u16());
                tracing::warn!(error = %e, destination = %destination, "failed to read response body");
                return ExecuteResult::err(e.to_string());
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::Span::current().record("status", status.as_u16());
        tracing::Span::current().record("latency_ms", elapsed_ms);

        // Parse as JSON when the content type says so; a body that fails to
        // parse is returned as text, never an error.
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let body = if content_type.as_deref().is_some_and(is_json_content_type) {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        } else {
            serde_json::Value::String(text)
        };

        tracing::info!(
            status = status.as_u16(),
            latency_ms = elapsed_ms,
            size = bytes.len(),
            "intercepted fetch complete"
        );

        ExecuteResult::ok(ResponseEnvelope {
            status: status.as_u16(),
            status_text,
            headers,
            body,
            content_type,
            time: format!("{elapsed_ms}ms"),
            size: format_bytes(bytes.len()),
            intercepted: true,
        })
    }
    .instrument(span)
    .await
}

/// Join the original request's path and query onto the target base URL.
///
/// An unparsable original URL routes to the target base unchanged.
pub fn destination_url(target_base: &str, original_url: &str) -> String {
    let base = target_base.trim_end_matches('/');
    match url::Url::parse(original_url) {
        Ok(parsed) => {
            let mut destination = format!("{base}{}", parsed.path());
            if let Some(query) = parsed.query() {
                destination.push('?');
                destination.push_str(query);
            }
            destination
        }
        Err(_) => base.to_string(),
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type.contains("json")
}

/// Human-readable byte count: binary prefixes, two decimal places.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
