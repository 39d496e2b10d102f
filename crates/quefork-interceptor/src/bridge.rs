//! Injected page bridge: the single page-global async call surface.
//!
//! Callers get a plain async function and never see the window-message
//! protocol. Each call posts under a fresh correlation id and races the
//! matching response against a fixed timeout; the response listener is
//! dropped on every settle path.

use std::time::Duration;

use crate::channel::{self, WindowBus};
use crate::correlation;
use crate::error::InterceptError;
use crate::protocol::{
    ExtensionAction, PageRequest, RequestDescriptor, ResponseEnvelope, WindowMessage,
};

pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PageBridge {
    bus: WindowBus,
    timeout: Duration,
}

impl PageBridge {
    pub fn new(bus: WindowBus) -> Self {
        Self::with_timeout(bus, DEFAULT_BRIDGE_TIMEOUT)
    }

    pub fn with_timeout(bus: WindowBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    /// Dispatch a request through the extension and wait for its envelope.
    pub async fn intercept_request(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ResponseEnvelope, InterceptError> {
        let id = correlation::generate_id();

        // Subscribe before posting so the response cannot slip past.
        let mut rx = self.bus.subscribe();
        self.bus.post(WindowMessage::FromQuefork(PageRequest::execute(
            id.clone(),
            descriptor,
        )));

        let reply = {
            let id = id.clone();
            tokio::time::timeout(
                self.timeout,
                channel::wait_for(&mut rx, move |msg| match msg {
                    WindowMessage::FromExtension(reply)
                        if reply.action == ExtensionAction::ExecuteResponse
                            && reply.id.as_deref() == Some(id.as_str()) =>
                    {
                        Some(reply)
                    }
                    _ => None,
                }),
            )
            .await
            .map_err(|_| InterceptError::Timeout)??
        };

        if let Some(error) = reply.error {
            return Err(InterceptError::Extension(error));
        }
        reply
            .response
            .ok_or_else(|| InterceptError::Extension("empty response".to_string()))
    }
}
