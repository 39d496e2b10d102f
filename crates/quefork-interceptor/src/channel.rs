//! Typed message channels between the isolated execution contexts.
//!
//! Three transports sit behind the same message type so routing and retry
//! logic is written once against [`WindowMessage`]:
//! - [`WindowBus`]: the page's window channel (many listeners, lossy
//!   fire-and-forget posts).
//! - [`page_port`]: a long-lived port from the router to one tab's relay;
//!   a failed send is the disconnect event.
//! - direct calls: `RouterHandle` commands (see `router`).

use tokio::sync::{broadcast, mpsc};

use crate::error::ChannelError;
use crate::protocol::WindowMessage;

const BUS_CAPACITY: usize = 64;
const PORT_CAPACITY: usize = 32;

/// The in-page event bus standing in for `window.postMessage`.
#[derive(Clone)]
pub struct WindowBus {
    tx: broadcast::Sender<WindowMessage>,
}

impl WindowBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Post a message to every current listener. Posting with no listeners
    /// is not an error; window messages are fire-and-forget.
    pub fn post(&self, msg: WindowMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.tx.subscribe()
    }
}

impl Default for WindowBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender half of a router→tab port.
pub type PortSender = mpsc::Sender<WindowMessage>;

/// Receiver half of a router→tab port.
pub type PortReceiver = mpsc::Receiver<WindowMessage>;

/// Create a port pair for registering a tab with the router.
pub fn page_port() -> (PortSender, PortReceiver) {
    mpsc::channel(PORT_CAPACITY)
}

/// Wait on a bus subscription for the first message accepted by `filter`.
///
/// Lagged receivers skip ahead and keep listening; messages the filter
/// rejects (foreign correlation ids, unrelated types) are dropped silently.
pub async fn wait_for<T>(
    rx: &mut broadcast::Receiver<WindowMessage>,
    mut filter: impl FnMut(WindowMessage) -> Option<T>,
) -> Result<T, ChannelError> {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                if let Some(value) = filter(msg) {
                    return Ok(value);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "window bus receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(ChannelError::Closed),
        }
    }
}
