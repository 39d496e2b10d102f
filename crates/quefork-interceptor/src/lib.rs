//! queFork request interception and multi-target routing.
//!
//! The subsystem spans four isolated execution contexts that only exchange
//! serialized messages: the page (interceptor client and injected bridge),
//! the per-tab content relay, the background router, and the same-origin
//! fallback proxy. The page probes for a live extension, routes requests
//! through it when present, and degrades to the proxy endpoint when the
//! extension is absent, times out, or fails.

pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod fallback;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod server;
pub mod storage;

pub use bridge::PageBridge;
pub use channel::WindowBus;
pub use client::{ClientConfig, InterceptedResponse, InterceptorClient};
pub use error::{ChannelError, InterceptError};
pub use fallback::FallbackProxy;
pub use relay::{ContentRelay, RelayConfig};
pub use router::{BackgroundRouter, ExtensionRuntime, RouterConfig, RouterHandle};
