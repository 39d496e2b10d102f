//! Axum HTTP server: fallback proxy route, health endpoint, graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use reqwest::Method;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::InterceptorConfig;
use crate::protocol::{ProxyEnvelope, RequestDescriptor};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
}

/// Build the service router. Separate from [`run`] so tests can mount it on
/// an ephemeral listener.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/proxy", post(handle_proxy))
        .route("/api/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server.
pub async fn run(config: InterceptorConfig) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()?;
    let listen_addr = config.server.listen_address.clone();

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "fallback proxy listening");

    axum::serve(listener, app(AppState { client }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("fallback proxy shut down gracefully");
    Ok(())
}

/// Handler for POST /api/proxy.
///
/// Every failure mode (unparsable request, upstream unreachable, body read
/// failure) collapses into the fixed 500 shape the page distinguishes from
/// a normal proxied response.
async fn handle_proxy(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match proxy_call(&state.client, &body).await {
        Ok(envelope) => (StatusCode::OK, axum::Json(envelope)).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "proxy fetch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "Failed to fetch" })),
            )
                .into_response()
        }
    }
}

async fn proxy_call(client: &reqwest::Client, body: &Bytes) -> anyhow::Result<ProxyEnvelope> {
    let descriptor: RequestDescriptor = serde_json::from_slice(body)?;
    let method = Method::from_bytes(descriptor.method.to_uppercase().as_bytes())
        .unwrap_or(Method::GET);

    let mut builder = client.request(method.clone(), &descriptor.url);
    for (name, value) in &descriptor.headers {
        builder = builder.header(name, value);
    }
    // Body omitted for GET/HEAD, JSON-serialized otherwise.
    if method != Method::GET && method != Method::HEAD {
        if let Some(ref request_body) = descriptor.body {
            builder = builder.json(request_body);
        }
    }

    let response = builder.send().await?;
    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    // JSON when the upstream body parses as JSON, raw text otherwise.
    let text = response.text().await?;
    let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

    Ok(ProxyEnvelope {
        status: status.as_u16(),
        status_text,
        headers,
        body,
    })
}

/// Health check endpoint. GET and HEAD, empty body; connectivity probes
/// must never be served from cache.
async fn handle_health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        (),
    )
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
