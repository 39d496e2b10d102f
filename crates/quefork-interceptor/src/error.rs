//! Error taxonomy for the interception subsystem.

use thiserror::Error;

/// Failures on a message channel between execution contexts.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer end of the channel is gone (router stopped, port dropped).
    #[error("message channel closed")]
    Closed,

    /// No background router has registered with the extension runtime.
    #[error("no extension runtime connected")]
    NotConnected,
}

/// Failures surfaced by the page-side interception paths.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// No matching response arrived within the fixed window.
    #[error("timed out waiting for extension response")]
    Timeout,

    /// The extension answered with an explicit error.
    #[error("extension error: {0}")]
    Extension(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The fallback proxy reported its fixed failure shape.
    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
