//! Span builder helpers for interceptor instrumentation.

/// Create a tracing span for an intercepted request executed by the router.
///
/// Usage: `let span = intercept_span!(correlation_id, url);`
///
/// Fields recorded later by the execute path:
/// - `target`: the resolved target base URL
/// - `status`: upstream HTTP status (0 on connection failure)
/// - `latency_ms`: milliseconds from dispatch to response
#[macro_export]
macro_rules! intercept_span {
    ($correlation_id:expr, $url:expr) => {
        tracing::info_span!(
            "intercept_request",
            correlation_id = %$correlation_id,
            url = %$url,
            target = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a relay forward to the background router.
#[macro_export]
macro_rules! relay_forward_span {
    ($correlation_id:expr) => {
        tracing::info_span!(
            "relay_forward",
            correlation_id = %$correlation_id,
            attempts = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a fallback proxy call.
#[macro_export]
macro_rules! proxy_fallback_span {
    ($method:expr, $url:expr) => {
        tracing::info_span!(
            "proxy_fallback",
            method = %$method,
            url = %$url,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
