//! Content relay: per-tab bridge between the page's window channel and the
//! background router.
//!
//! The relay answers liveness probes itself (the router is not involved in
//! detection), forwards page actions to the router with a bounded retry,
//! and re-posts router-originated messages to the page verbatim. The
//! long-lived router port can be severed by an extension reload; the relay
//! keeps attempting to re-establish it for as long as the tab lives.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::channel::{self, PortReceiver, WindowBus};
use crate::error::ChannelError;
use crate::protocol::{ExecuteRequest, ExecuteResult, ExtensionReply, PageRequest, WindowMessage};
use crate::router::ExtensionRuntime;

/// Retry policy for calls into the background process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Handle to a running relay task. Dropping it tears the bridge down.
pub struct ContentRelay {
    task: JoinHandle<()>,
}

impl ContentRelay {
    pub fn spawn(bus: WindowBus, runtime: ExtensionRuntime, config: RelayConfig) -> Self {
        // Subscribe synchronously here, before the task is spawned, so posts
        // made immediately after spawn() returns are not lost to a late
        // subscription inside the not-yet-polled task.
        let page_rx = bus.subscribe();
        let task = tokio::spawn(run(bus, page_rx, runtime, config));
        Self { task }
    }
}

impl Drop for ContentRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    bus: WindowBus,
    mut page_rx: tokio::sync::broadcast::Receiver<WindowMessage>,
    runtime: ExtensionRuntime,
    config: RelayConfig,
) {
    // Ids the page is still waiting on. A completion whose id was already
    // settled (or never tracked) is dropped without reaching the page.
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut port_rx = try_connect_port(&runtime).await;

    loop {
        tokio::select! {
            msg = page_rx.recv() => match msg {
                Ok(msg) => handle_page_message(msg, &bus, &runtime, &config, &in_flight),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "relay lagged behind the window bus");
                }
                // The page is gone; so is the relay's reason to exist.
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            event = port_event(&mut port_rx, config.retry_delay) => match event {
                // Router-originated messages are re-posted unmodified.
                PortEvent::Message(msg) => bus.post(msg),
                PortEvent::Disconnected => {
                    tracing::warn!("router port disconnected");
                    port_rx = None;
                }
                PortEvent::Reconnect => {
                    port_rx = try_connect_port(&runtime).await;
                    if port_rx.is_some() {
                        tracing::info!("router port re-established");
                    }
                }
            },
        }
    }
}

enum PortEvent {
    Message(WindowMessage),
    Disconnected,
    Reconnect,
}

/// Next event on the router port: a message, the disconnect, or (while
/// disconnected) a delayed prompt to attempt reconnection.
async fn port_event(port_rx: &mut Option<PortReceiver>, retry_delay: Duration) -> PortEvent {
    match port_rx {
        Some(rx) => match rx.recv().await {
            Some(msg) => PortEvent::Message(msg),
            None => PortEvent::Disconnected,
        },
        None => {
            tokio::time::sleep(retry_delay).await;
            PortEvent::Reconnect
        }
    }
}

async fn try_connect_port(runtime: &ExtensionRuntime) -> Option<PortReceiver> {
    let handle = runtime.connect().ok()?;
    let (tx, rx) = channel::page_port();
    handle.connect_port(tx).await.ok()?;
    Some(rx)
}

fn handle_page_message(
    msg: WindowMessage,
    bus: &WindowBus,
    runtime: &ExtensionRuntime,
    config: &RelayConfig,
    in_flight: &Arc<Mutex<HashSet<String>>>,
) {
    match msg {
        // Liveness probe: the relay itself answering proves the extension
        // is alive in this tab.
        WindowMessage::DetectExtension { id } => {
            bus.post(WindowMessage::ExtensionDetected { id });
        }
        WindowMessage::FromQuefork(request) => {
            forward_execute(request, bus, runtime, config, in_flight);
        }
        WindowMessage::InterceptorToggle { enabled } => {
            let runtime = runtime.clone();
            let config = config.clone();
            // No page-visible ack; failures only get logged.
            tokio::spawn(async move {
                if let Err(e) = toggle_with_retry(&runtime, &config, enabled).await {
                    tracing::warn!(error = %e, "failed to forward interceptor toggle");
                }
            });
        }
        // Extension-originated traffic on the bus is page-bound; not ours.
        _ => {}
    }
}

fn forward_execute(
    request: PageRequest,
    bus: &WindowBus,
    runtime: &ExtensionRuntime,
    config: &RelayConfig,
    in_flight: &Arc<Mutex<HashSet<String>>>,
) {
    let id = request.id.clone();
    in_flight.lock().unwrap().insert(id.clone());

    let bus = bus.clone();
    let runtime = runtime.clone();
    let config = config.clone();
    let in_flight = in_flight.clone();
    tokio::spawn(async move {
        let span = quefork_tracing::relay_forward_span!(&id);
        let execute = ExecuteRequest::from(request);
        let result = forward_with_retry(&runtime, &config, execute, &id)
            .instrument(span)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, correlation_id = %id, "background call retries exhausted");
                ExecuteResult::err("extension unavailable")
            });

        // Settle the id exactly once; a late duplicate finds it gone.
        if in_flight.lock().unwrap().remove(&id) {
            bus.post(WindowMessage::FromExtension(ExtensionReply::execute_response(
                id, result,
            )));
        }
    });
}

async fn forward_with_retry(
    runtime: &ExtensionRuntime,
    config: &RelayConfig,
    request: ExecuteRequest,
    correlation_id: &str,
) -> Result<ExecuteResult, ChannelError> {
    let mut last_error = ChannelError::NotConnected;
    for attempt in 1..=config.max_attempts {
        tracing::Span::current().record("attempts", attempt);
        let outcome = match runtime.connect() {
            Ok(handle) => {
                handle
                    .execute(request.clone(), correlation_id.to_string())
                    .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = e;
                tracing::debug!(attempt, error = %e, "background call failed");
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }
    Err(last_error)
}

async fn toggle_with_retry(
    runtime: &ExtensionRuntime,
    config: &RelayConfig,
    enabled: bool,
) -> Result<(), ChannelError> {
    let mut last_error = ChannelError::NotConnected;
    for attempt in 1..=config.max_attempts {
        let outcome = match runtime.connect() {
            Ok(handle) => handle.toggle_interceptor(enabled).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e;
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }
    Err(last_error)
}
