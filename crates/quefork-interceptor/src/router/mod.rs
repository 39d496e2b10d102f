//! Background router: owns routing policy and state, executes intercepted
//! fetches, tracks statistics, and relays state changes to every connected
//! surface.
//!
//! All mutable state lives in one task; everything else talks to it through
//! [`RouterHandle`] commands. Each transition persists its snapshot before
//! the next command is processed.

pub mod fetch;
pub mod stats;
pub mod targets;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::channel::PortSender;
use crate::error::ChannelError;
use crate::protocol::{ExecuteRequest, ExecuteResult, ExtensionReply, WindowMessage};
use crate::storage::{self, keys, ExtensionStorage};
use stats::{EndpointRecord, RequestStats, DEFAULT_MAX_TRACKED_ENDPOINTS};
use targets::{RoutingMode, Target, TargetError, TargetList};

const COMMAND_CAPACITY: usize = 64;
const SURFACE_CAPACITY: usize = 16;

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_tracked_endpoints: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_tracked_endpoints: DEFAULT_MAX_TRACKED_ENDPOINTS,
        }
    }
}

/// Extension toolbar badge, mirrored from the enabled flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub text: &'static str,
    pub color: BadgeColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeColor {
    Green,
    Gray,
}

impl Badge {
    fn for_enabled(enabled: bool) -> Self {
        if enabled {
            Self {
                text: "ON",
                color: BadgeColor::Green,
            }
        } else {
            Self {
                text: "OFF",
                color: BadgeColor::Gray,
            }
        }
    }
}

/// State-change notifications for extension surfaces (popup, options page).
#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    StatsUpdated,
    InterceptorStateChanged { enabled: bool },
}

/// Point-in-time view of router state for management surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSnapshot {
    pub targets: Vec<Target>,
    pub active_target_index: usize,
    pub target_mode: RoutingMode,
    pub interceptor_enabled: bool,
    pub enabled_endpoints: Vec<String>,
    pub badge: Badge,
}

/// Failures surfaced by management commands.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Target(#[from] TargetError),
}

enum RouterCommand {
    Execute {
        request: ExecuteRequest,
        correlation_id: String,
        reply: oneshot::Sender<ExecuteResult>,
    },
    ToggleInterceptor {
        enabled: bool,
    },
    ConnectPort {
        port: PortSender,
    },
    AddTarget {
        target: Target,
    },
    RemoveTarget {
        index: usize,
        reply: oneshot::Sender<Result<(), TargetError>>,
    },
    SetActiveTarget {
        index: usize,
        reply: oneshot::Sender<Result<(), TargetError>>,
    },
    SetMode {
        mode: RoutingMode,
    },
    SetEnabledEndpoints {
        endpoints: Vec<String>,
    },
    ClearStats,
    StatsSnapshot {
        reply: oneshot::Sender<HashMap<String, EndpointRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<RouterSnapshot>,
    },
    /// Internal: a spawned fetch completed successfully.
    RecordCompleted {
        url: String,
        target_url: String,
    },
    Shutdown,
}

/// Registry the content relays reconnect through. A restarted router
/// re-registers here; a handle whose router is gone reads as disconnected.
#[derive(Clone, Default)]
pub struct ExtensionRuntime {
    current: Arc<RwLock<Option<RouterHandle>>>,
}

impl ExtensionRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: RouterHandle) {
        *self.current.write().unwrap() = Some(handle);
    }

    pub fn connect(&self) -> Result<RouterHandle, ChannelError> {
        match self.current.read().unwrap().as_ref() {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(ChannelError::NotConnected),
        }
    }
}

/// Cloneable command surface onto a running router.
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<RouterCommand>,
    surfaces: broadcast::Sender<SurfaceEvent>,
}

impl RouterHandle {
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RouterCommand,
    ) -> Result<T, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    async fn cast(&self, command: RouterCommand) -> Result<(), ChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Execute an intercepted request and wait for its result.
    pub async fn execute(
        &self,
        request: ExecuteRequest,
        correlation_id: String,
    ) -> Result<ExecuteResult, ChannelError> {
        self.call(|reply| RouterCommand::Execute {
            request,
            correlation_id,
            reply,
        })
        .await
    }

    /// Flip the interceptor flag. No reply; state lands via broadcasts.
    pub async fn toggle_interceptor(&self, enabled: bool) -> Result<(), ChannelError> {
        self.cast(RouterCommand::ToggleInterceptor { enabled }).await
    }

    /// Register a long-lived port to one tab's content relay.
    pub async fn connect_port(&self, port: PortSender) -> Result<(), ChannelError> {
        self.cast(RouterCommand::ConnectPort { port }).await
    }

    pub async fn add_target(&self, target: Target) -> Result<(), ChannelError> {
        self.cast(RouterCommand::AddTarget { target }).await
    }

    pub async fn remove_target(&self, index: usize) -> Result<(), RouterError> {
        self.call(|reply| RouterCommand::RemoveTarget { index, reply })
            .await??;
        Ok(())
    }

    pub async fn set_active_target(&self, index: usize) -> Result<(), RouterError> {
        self.call(|reply| RouterCommand::SetActiveTarget { index, reply })
            .await??;
        Ok(())
    }

    pub async fn set_mode(&self, mode: RoutingMode) -> Result<(), ChannelError> {
        self.cast(RouterCommand::SetMode { mode }).await
    }

    pub async fn set_enabled_endpoints(&self, endpoints: Vec<String>) -> Result<(), ChannelError> {
        self.cast(RouterCommand::SetEnabledEndpoints { endpoints })
            .await
    }

    pub async fn clear_stats(&self) -> Result<(), ChannelError> {
        self.cast(RouterCommand::ClearStats).await
    }

    pub async fn stats_snapshot(&self) -> Result<HashMap<String, EndpointRecord>, ChannelError> {
        self.call(|reply| RouterCommand::StatsSnapshot { reply }).await
    }

    pub async fn snapshot(&self) -> Result<RouterSnapshot, ChannelError> {
        self.call(|reply| RouterCommand::Snapshot { reply }).await
    }

    /// Stop the router task. Ports close; relays will retry and surface
    /// failures until a new router registers.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        self.cast(RouterCommand::Shutdown).await
    }

    pub fn subscribe_surfaces(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.surfaces.subscribe()
    }
}

/// The background router process.
pub struct BackgroundRouter {
    state: TargetList,
    stats: RequestStats,
    interceptor_enabled: bool,
    enabled_endpoints: Vec<String>,
    badge: Badge,
    ports: Vec<PortSender>,
    storage: Arc<dyn ExtensionStorage>,
    client: reqwest::Client,
    surfaces: broadcast::Sender<SurfaceEvent>,
}

impl BackgroundRouter {
    /// Rebuild router state from storage. Missing keys take first-run
    /// defaults; the reserved target is reinserted if a snapshot lost it.
    pub async fn load(
        storage: Arc<dyn ExtensionStorage>,
        client: reqwest::Client,
        config: RouterConfig,
    ) -> Result<Self> {
        let targets: Option<Vec<Target>> = storage::load_typed(&*storage, keys::TARGETS).await?;
        let active_index: Option<usize> =
            storage::load_typed(&*storage, keys::ACTIVE_TARGET_INDEX).await?;
        let mode: Option<RoutingMode> = storage::load_typed(&*storage, keys::TARGET_MODE).await?;
        let state = match targets {
            Some(targets) => {
                TargetList::from_parts(targets, active_index.unwrap_or(0), mode.unwrap_or_default())
            }
            None => TargetList::new(),
        };

        let entries: Option<HashMap<String, EndpointRecord>> =
            storage::load_typed(&*storage, keys::REQUEST_STATS).await?;
        let stats =
            RequestStats::from_entries(entries.unwrap_or_default(), config.max_tracked_endpoints);

        let interceptor_enabled: bool = storage::load_typed(&*storage, keys::INTERCEPTOR_ENABLED)
            .await?
            .unwrap_or(true);
        let enabled_endpoints: Vec<String> =
            storage::load_typed(&*storage, keys::ENABLED_ENDPOINTS)
                .await?
                .unwrap_or_default();

        let (surfaces, _) = broadcast::channel(SURFACE_CAPACITY);

        Ok(Self {
            state,
            stats,
            interceptor_enabled,
            enabled_endpoints,
            badge: Badge::for_enabled(interceptor_enabled),
            ports: Vec::new(),
            storage,
            client,
            surfaces,
        })
    }

    /// Start the router task and register its handle with the runtime.
    pub fn spawn(self, runtime: &ExtensionRuntime) -> RouterHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = RouterHandle {
            commands: tx.clone(),
            surfaces: self.surfaces.clone(),
        };
        runtime.register(handle.clone());
        tokio::spawn(self.run(rx, tx));
        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RouterCommand>,
        internal: mpsc::Sender<RouterCommand>,
    ) {
        tracing::info!(
            targets = self.state.targets().len(),
            enabled = self.interceptor_enabled,
            "background router started"
        );
        while let Some(command) = commands.recv().await {
            match command {
                RouterCommand::Execute {
                    request,
                    correlation_id,
                    reply,
                } => self.handle_execute(request, correlation_id, reply, &internal),
                RouterCommand::ToggleInterceptor { enabled } => {
                    self.set_interceptor_enabled(enabled).await;
                }
                RouterCommand::ConnectPort { port } => {
                    self.ports.push(port);
                    tracing::debug!(ports = self.ports.len(), "content relay port connected");
                }
                RouterCommand::AddTarget { target } => {
                    self.state.add(target);
                    self.persist_routing_state().await;
                }
                RouterCommand::RemoveTarget { index, reply } => {
                    let result = self.state.remove(index).map(|_| ());
                    if result.is_ok() {
                        self.persist_routing_state().await;
                    }
                    let _ = reply.send(result);
                }
                RouterCommand::SetActiveTarget { index, reply } => {
                    let result = self.state.set_active(index);
                    if result.is_ok() {
                        self.persist_routing_state().await;
                    }
                    let _ = reply.send(result);
                }
                RouterCommand::SetMode { mode } => {
                    self.state.set_mode(mode);
                    self.persist_routing_state().await;
                }
                RouterCommand::SetEnabledEndpoints { endpoints } => {
                    self.enabled_endpoints = endpoints;
                    self.persist(keys::ENABLED_ENDPOINTS, &self.enabled_endpoints).await;
                }
                RouterCommand::ClearStats => {
                    self.stats.clear();
                    self.persist(keys::REQUEST_STATS, self.stats.entries()).await;
                    let _ = self.surfaces.send(SurfaceEvent::StatsUpdated);
                    self.broadcast_to_ports(WindowMessage::FromExtension(
                        ExtensionReply::stats_updated(),
                    ));
                }
                RouterCommand::StatsSnapshot { reply } => {
                    let _ = reply.send(self.stats.entries().clone());
                }
                RouterCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                RouterCommand::RecordCompleted { url, target_url } => {
                    self.record_completed(&url, &target_url).await;
                }
                RouterCommand::Shutdown => break,
            }
        }
        tracing::info!("background router stopped");
    }

    fn handle_execute(
        &mut self,
        request: ExecuteRequest,
        correlation_id: String,
        reply: oneshot::Sender<ExecuteResult>,
        internal: &mpsc::Sender<RouterCommand>,
    ) {
        if !self.interceptor_enabled {
            let _ = reply.send(ExecuteResult::err("interceptor is disabled"));
            return;
        }

        let target_url = request
            .target_url
            .clone()
            .or_else(|| self.state.resolve(&request.url).map(|t| t.url.clone()));
        let Some(target_url) = target_url else {
            let _ = reply.send(ExecuteResult::err("no target configured"));
            return;
        };

        // The fetch runs off the command loop so slow upstreams never block
        // routing; the completion report comes back as an internal command.
        let client = self.client.clone();
        let internal = internal.clone();
        tokio::spawn(async move {
            let result = fetch::execute(&client, &request, &target_url, &correlation_id).await;
            if result.success {
                let _ = internal
                    .send(RouterCommand::RecordCompleted {
                        url: request.url,
                        target_url,
                    })
                    .await;
            }
            let _ = reply.send(result);
        });
    }

    async fn record_completed(&mut self, url: &str, target_url: &str) {
        self.stats.record(url, target_url, chrono::Utc::now());
        self.persist(keys::REQUEST_STATS, self.stats.entries()).await;
        // Surfaces and tab ports are independent best-effort channels.
        let _ = self.surfaces.send(SurfaceEvent::StatsUpdated);
        self.broadcast_to_ports(WindowMessage::FromExtension(ExtensionReply::stats_updated()));
    }

    async fn set_interceptor_enabled(&mut self, enabled: bool) {
        self.interceptor_enabled = enabled;
        self.badge = Badge::for_enabled(enabled);
        tracing::info!(enabled, badge = self.badge.text, "interceptor toggled");
        self.persist(keys::INTERCEPTOR_ENABLED, &enabled).await;
        let _ = self.surfaces.send(SurfaceEvent::InterceptorStateChanged { enabled });
        self.broadcast_to_ports(WindowMessage::InterceptorStateChanged { enabled });
    }

    fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            targets: self.state.targets().to_vec(),
            active_target_index: self.state.active_index(),
            target_mode: self.state.mode(),
            interceptor_enabled: self.interceptor_enabled,
            enabled_endpoints: self.enabled_endpoints.clone(),
            badge: self.badge.clone(),
        }
    }

    /// Send to every connected port, pruning ports whose relay is gone.
    /// A full port drops this message but stays connected; sends to the
    /// remaining ports proceed regardless of individual failures.
    fn broadcast_to_ports(&mut self, msg: WindowMessage) {
        self.ports.retain(|port| match port.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("tab port full, dropping broadcast");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("tab port disconnected, removing");
                false
            }
        });
    }

    async fn persist_routing_state(&self) {
        self.persist(keys::TARGETS, &self.state.targets().to_vec()).await;
        self.persist(keys::ACTIVE_TARGET_INDEX, &self.state.active_index())
            .await;
        self.persist(keys::TARGET_MODE, &self.state.mode()).await;
    }

    /// Persist one key, logging instead of dying: storage trouble must not
    /// take the router down mid-session.
    async fn persist<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = storage::store_typed(&*self.storage, key, value).await {
            tracing::warn!(key, error = %e, "failed to persist router state");
        }
    }
}
