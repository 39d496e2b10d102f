//! Page-side interceptor client: the web application's single integration
//! point for routing outgoing API calls through the extension or the
//! same-origin fallback proxy.
//!
//! Presence of the extension is never assumed: a probe/answer exchange on
//! the window channel re-evaluates it on a fixed interval, and every
//! intercepted request carries its own fallback. The extension path
//! failing is a soft failure the caller never sees.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::channel::{self, WindowBus};
use crate::correlation;
use crate::error::InterceptError;
use crate::fallback::FallbackProxy;
use crate::protocol::{
    ExtensionAction, PageRequest, ProxyEnvelope, RequestDescriptor, ResponseEnvelope,
    WindowMessage,
};
use crate::storage::{self, keys, ExtensionStorage};

/// Placeholder URL used by the self-test. Never actually fetched from the
/// page; the extension (or proxy) performs whatever call it maps to.
pub const SELF_TEST_URL: &str = "https://example.com/quefork-self-test";

/// Timing knobs for detection and interception.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Period of the liveness probe loop.
    pub probe_interval: Duration,
    /// Answer window for periodic probes.
    pub probe_timeout: Duration,
    /// Answer window for the one-shot startup probe.
    pub startup_probe_timeout: Duration,
    /// How long to wait on the extension before falling back to the proxy.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(500),
            startup_probe_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Extension presence, as last observed by the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Unknown,
    Probing,
    Present,
    Absent,
}

#[derive(Debug)]
struct ClientState {
    detection: DetectionState,
    interceptor_enabled: bool,
}

/// Result of an intercepted request: which path served it, and its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptedResponse {
    Extension(ResponseEnvelope),
    Proxy(ProxyEnvelope),
}

impl InterceptedResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Extension(envelope) => envelope.status,
            Self::Proxy(envelope) => envelope.status,
        }
    }

    pub fn body(&self) -> &serde_json::Value {
        match self {
            Self::Extension(envelope) => &envelope.body,
            Self::Proxy(envelope) => &envelope.body,
        }
    }

    pub fn via_extension(&self) -> bool {
        matches!(self, Self::Extension(_))
    }
}

pub struct InterceptorClient {
    bus: WindowBus,
    proxy: FallbackProxy,
    prefs: Arc<dyn ExtensionStorage>,
    state: Arc<Mutex<ClientState>>,
    config: ClientConfig,
    detection_task: JoinHandle<()>,
}

impl Drop for InterceptorClient {
    // Component teardown: the probe loop and its pending timers go with us.
    fn drop(&mut self) {
        self.detection_task.abort();
    }
}

impl InterceptorClient {
    /// Mount the client: restore the persisted toggle and start the
    /// detection loop (one startup probe, then the fixed interval forever).
    pub async fn mount(
        bus: WindowBus,
        proxy: FallbackProxy,
        prefs: Arc<dyn ExtensionStorage>,
        config: ClientConfig,
    ) -> anyhow::Result<Self> {
        let interceptor_enabled = storage::load_typed(&*prefs, keys::INTERCEPTOR_ENABLED)
            .await?
            .unwrap_or(false);
        let state = Arc::new(Mutex::new(ClientState {
            detection: DetectionState::Unknown,
            interceptor_enabled,
        }));

        let detection_task = tokio::spawn(run_detection(
            bus.clone(),
            prefs.clone(),
            state.clone(),
            config.clone(),
        ));

        Ok(Self {
            bus,
            proxy,
            prefs,
            state,
            config,
            detection_task,
        })
    }

    pub fn has_extension(&self) -> bool {
        self.state.lock().unwrap().detection == DetectionState::Present
    }

    pub fn detection_state(&self) -> DetectionState {
        self.state.lock().unwrap().detection
    }

    pub fn interceptor_enabled(&self) -> bool {
        self.state.lock().unwrap().interceptor_enabled
    }

    /// Flip the toggle, persist it, and notify the extension best-effort.
    pub async fn toggle_interceptor(&self) -> anyhow::Result<bool> {
        let enabled = {
            let mut state = self.state.lock().unwrap();
            state.interceptor_enabled = !state.interceptor_enabled;
            state.interceptor_enabled
        };
        storage::store_typed(&*self.prefs, keys::INTERCEPTOR_ENABLED, &enabled).await?;
        // No extension listening is fine; the message just goes nowhere.
        self.bus.post(WindowMessage::InterceptorToggle { enabled });
        Ok(enabled)
    }

    /// Route a request: extension when present, proxy otherwise, and proxy
    /// again when the extension attempt times out or errors. The extension
    /// failure is masked; only a proxy failure reaches the caller.
    pub async fn intercept_request(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<InterceptedResponse, InterceptError> {
        if !self.has_extension() {
            return self
                .proxy
                .forward(descriptor)
                .await
                .map(InterceptedResponse::Proxy);
        }

        match self.attempt_extension(descriptor).await {
            Ok(envelope) => Ok(InterceptedResponse::Extension(envelope)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    url = %descriptor.url,
                    "extension path failed, falling back to proxy"
                );
                self.proxy
                    .forward(descriptor)
                    .await
                    .map(InterceptedResponse::Proxy)
            }
        }
    }

    /// Issue a synthetic request and check it actually went through the
    /// extension. Any failure is a plain `false`.
    pub async fn self_test(&self) -> bool {
        match self
            .intercept_request(&RequestDescriptor::get(SELF_TEST_URL))
            .await
        {
            Ok(InterceptedResponse::Extension(envelope)) => envelope.intercepted,
            _ => false,
        }
    }

    async fn attempt_extension(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ResponseEnvelope, InterceptError> {
        let id = correlation::generate_id();

        // Subscribe before posting so the response cannot slip past; the
        // subscription drops on every settle path, so exactly one of
        // success, explicit error, or timeout resolves this call.
        let mut rx = self.bus.subscribe();
        self.bus.post(WindowMessage::FromQuefork(PageRequest::execute(
            id.clone(),
            descriptor,
        )));

        let reply = {
            let id = id.clone();
            tokio::time::timeout(
                self.config.request_timeout,
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

/// The detection loop: `Unknown → Probing → {Present, Absent}`, then
/// re-evaluated every interval. Also mirrors unsolicited toggle state from
/// the extension so neither side is the strict leader.
async fn run_detection(
    bus: WindowBus,
    prefs: Arc<dyn ExtensionStorage>,
    state: Arc<Mutex<ClientState>>,
    config: ClientConfig,
) {
    let mut rx = bus.subscribe();
    let mut interval = tokio::time::interval(config.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Outstanding probe: its correlation id and answer deadline.
    let mut pending: Option<(String, Pin<Box<tokio::time::Sleep>>)> = None;
    let mut first_probe = true;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if pending.is_none() {
                    let id = correlation::generate_id();
                    let window = if first_probe {
                        config.startup_probe_timeout
                    } else {
                        config.probe_timeout
                    };
                    first_probe = false;
                    {
                        let mut state = state.lock().unwrap();
                        if state.detection == DetectionState::Unknown {
                            state.detection = DetectionState::Probing;
                        }
                    }
                    bus.post(WindowMessage::DetectExtension { id: id.clone() });
                    pending = Some((id, Box::pin(tokio::time::sleep(window))));
                }
            }
            msg = rx.recv() => match msg {
                Ok(WindowMessage::ExtensionDetected { id }) => {
                    if pending.as_ref().is_some_and(|(expected, _)| *expected == id) {
                        pending = None;
                        let flipped = {
                            let mut state = state.lock().unwrap();
                            let flipped = state.detection != DetectionState::Present;
                            state.detection = DetectionState::Present;
                            flipped
                        };
                        if flipped {
                            tracing::info!("extension detected");
                        }
                    }
                    // Answers to stale probes are dropped.
                }
                Ok(WindowMessage::InterceptorStateChanged { enabled }) => {
                    state.lock().unwrap().interceptor_enabled = enabled;
                    if let Err(e) =
                        storage::store_typed(&*prefs, keys::INTERCEPTOR_ENABLED, &enabled).await
                    {
                        tracing::warn!(error = %e, "failed to persist mirrored toggle state");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "detection loop lagged behind the window bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = probe_deadline(&mut pending) => {
                pending = None;
                let forced_off = {
                    let mut state = state.lock().unwrap();
                    let flipped = state.detection != DetectionState::Absent;
                    state.detection = DetectionState::Absent;
                    if flipped {
                        tracing::info!("extension absent");
                    }
                    // The interceptor cannot be meaningfully enabled
                    // without the extension.
                    std::mem::replace(&mut state.interceptor_enabled, false)
                };
                if forced_off {
                    if let Err(e) =
                        storage::store_typed(&*prefs, keys::INTERCEPTOR_ENABLED, &false).await
                    {
                        tracing::warn!(error = %e, "failed to persist forced-off toggle state");
                    }
                }
            }
        }
    }
}

/// Resolves when the outstanding probe's answer window closes; pends
/// forever while no probe is outstanding.
async fn probe_deadline(pending: &mut Option<(String, Pin<Box<tokio::time::Sleep>>)>) {
    match pending {
        Some((_, sleep)) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(25),
            startup_probe_timeout: Duration::from_millis(50),
            request_timeout: Duration::from_millis(100),
        }
    }

    /// Answer detection probes on the bus, standing in for the content
    /// relay of an installed extension.
    fn fake_detection_responder(bus: &WindowBus) -> JoinHandle<()> {
        let bus = bus.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let WindowMessage::DetectExtension { id } = msg {
                    bus.post(WindowMessage::ExtensionDetected { id });
                }
            }
        })
    }

    async fn mount_client(bus: &WindowBus, prefs: Arc<dyn ExtensionStorage>) -> InterceptorClient {
        // The proxy base is never reached by the detection-only tests.
        let proxy = FallbackProxy::new(reqwest::Client::new(), "http://127.0.0.1:1");
        InterceptorClient::mount(bus.clone(), proxy, prefs, fast_config())
            .await
            .unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_detection_becomes_present_with_responder() {
        let bus = WindowBus::new();
        let _responder = fake_detection_responder(&bus);

        let client = mount_client(&bus, Arc::new(storage::MemoryStorage::new())).await;
        wait_until(|| client.has_extension()).await;
        assert_eq!(client.detection_state(), DetectionState::Present);
    }

    #[tokio::test]
    async fn test_detection_becomes_absent_without_responder() {
        let bus = WindowBus::new();
        let client = mount_client(&bus, Arc::new(storage::MemoryStorage::new())).await;

        wait_until(|| client.detection_state() == DetectionState::Absent).await;
        assert!(!client.has_extension());
    }

    #[tokio::test]
    async fn test_absence_forces_persisted_toggle_off() {
        let prefs: Arc<dyn ExtensionStorage> = Arc::new(storage::MemoryStorage::new());
        storage::store_typed(&*prefs, keys::INTERCEPTOR_ENABLED, &true)
            .await
            .unwrap();

        let bus = WindowBus::new();
        let client = mount_client(&bus, prefs.clone()).await;
        // Restored from storage before the first probe settles.
        assert!(client.interceptor_enabled());

        wait_until(|| !client.interceptor_enabled()).await;
        let stored: Option<bool> = storage::load_typed(&*prefs, keys::INTERCEPTOR_ENABLED)
            .await
            .unwrap();
        assert_eq!(stored, Some(false));
    }

    #[tokio::test]
    async fn test_toggle_persists_and_notifies() {
        let bus = WindowBus::new();
        let _responder = fake_detection_responder(&bus);
        let prefs: Arc<dyn ExtensionStorage> = Arc::new(storage::MemoryStorage::new());
        let client = mount_client(&bus, prefs.clone()).await;
        wait_until(|| client.has_extension()).await;

        let mut rx = bus.subscribe();
        let enabled = client.toggle_interceptor().await.unwrap();
        assert!(enabled);

        let observed = tokio::time::timeout(
            Duration::from_secs(1),
            channel::wait_for(&mut rx, |msg| match msg {
                WindowMessage::InterceptorToggle { enabled } => Some(enabled),
                _ => None,
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(observed);

        let stored: Option<bool> = storage::load_typed(&*prefs, keys::INTERCEPTOR_ENABLED)
            .await
            .unwrap();
        assert_eq!(stored, Some(true));
    }

    #[tokio::test]
    async fn test_state_changed_messages_are_mirrored() {
        let bus = WindowBus::new();
        let _responder = fake_detection_responder(&bus);
        let prefs: Arc<dyn ExtensionStorage> = Arc::new(storage::MemoryStorage::new());
        let client = mount_client(&bus, prefs.clone()).await;
        wait_until(|| client.has_extension()).await;

        bus.post(WindowMessage::InterceptorStateChanged { enabled: true });
        wait_until(|| client.interceptor_enabled()).await;

        let stored: Option<bool> = storage::load_typed(&*prefs, keys::INTERCEPTOR_ENABLED)
            .await
            .unwrap();
        assert_eq!(stored, Some(true));
    }

    #[tokio::test]
    async fn test_persisted_toggle_survives_remount() {
        let bus = WindowBus::new();
        let _responder = fake_detection_responder(&bus);
        let prefs: Arc<dyn ExtensionStorage> = Arc::new(storage::MemoryStorage::new());

        {
            let client = mount_client(&bus, prefs.clone()).await;
            wait_until(|| client.has_extension()).await;
            client.toggle_interceptor().await.unwrap();
            assert!(client.interceptor_enabled());
        }

        // Simulated page reload: a fresh mount restores the persisted value
        // before any probe answer arrives.
        let client = mount_client(&bus, prefs).await;
        assert!(client.interceptor_enabled());
    }
}
