//! End-to-end wiring of the interception subsystem: page client, content
//! relay, background router, and the fallback proxy endpoint.

use std::sync::Arc;
use std::time::Duration;

use quefork_interceptor::client::{DetectionState, SELF_TEST_URL};
use quefork_interceptor::protocol::{
    ExecuteResult, ExtensionReply, RequestDescriptor, ResponseEnvelope, WindowMessage,
};
use quefork_interceptor::router::targets::{RoutingMode, Target};
use quefork_interceptor::router::{BackgroundRouter, RouterHandle};
use quefork_interceptor::server::{self, AppState};
use quefork_interceptor::storage::{self, keys, ExtensionStorage, JsonFileStorage, MemoryStorage};
use quefork_interceptor::{
    ClientConfig, ContentRelay, ExtensionRuntime, FallbackProxy, InterceptedResponse,
    InterceptorClient, RelayConfig, RouterConfig, WindowBus,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client_config() -> ClientConfig {
    ClientConfig {
        probe_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(25),
        startup_probe_timeout: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
    }
}

fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        max_attempts: 3,
        retry_delay: Duration::from_millis(10),
    }
}

/// Bind the fallback proxy endpoint on an ephemeral port.
async fn spawn_proxy_server() -> String {
    let state = AppState {
        client: reqwest::Client::new(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::app(state)).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_router(
    runtime: &ExtensionRuntime,
    storage: Arc<dyn ExtensionStorage>,
) -> RouterHandle {
    let router = BackgroundRouter::load(storage, reqwest::Client::new(), RouterConfig::default())
        .await
        .unwrap();
    router.spawn(runtime)
}

async fn mount_client(bus: &WindowBus, proxy_base: &str, config: ClientConfig) -> InterceptorClient {
    InterceptorClient::mount(
        bus.clone(),
        FallbackProxy::new(reqwest::Client::new(), proxy_base),
        Arc::new(MemoryStorage::new()),
        config,
    )
    .await
    .unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// No extension installed: detection settles on absent within one probe
/// cycle, and requests go straight to the proxy endpoint.
#[tokio::test]
async fn test_no_extension_falls_back_to_proxy_directly() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"n": 42})))
        .mount(&upstream)
        .await;

    let proxy_base = spawn_proxy_server().await;
    let bus = WindowBus::new();
    let client = mount_client(&bus, &proxy_base, fast_client_config()).await;

    wait_until(|| client.detection_state() == DetectionState::Absent).await;

    let response = client
        .intercept_request(&RequestDescriptor::get(format!("{}/data", upstream.uri())))
        .await
        .unwrap();
    assert!(!response.via_extension());
    assert_eq!(response.status(), 200);
    assert_eq!(response.body()["n"], 42);
}

/// Extension installed, active mode, single added target: the request is
/// redirected to the target and statistics record the hit.
#[tokio::test]
async fn test_extension_routes_to_active_target_with_stats() {
    let target_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"routed": true})))
        .mount(&target_server)
        .await;

    let runtime = ExtensionRuntime::new();
    let handle = spawn_router(&runtime, Arc::new(MemoryStorage::new())).await;
    handle
        .add_target(Target::new(target_server.uri(), None, RoutingMode::Active))
        .await
        .unwrap();
    handle.set_active_target(1).await.unwrap();

    let bus = WindowBus::new();
    let _relay = ContentRelay::spawn(bus.clone(), runtime, fast_relay_config());
    let proxy_base = spawn_proxy_server().await;
    let client = mount_client(&bus, &proxy_base, fast_client_config()).await;
    wait_until(|| client.has_extension()).await;

    let response = client
        .intercept_request(&RequestDescriptor::get("http://example.com/test"))
        .await
        .unwrap();
    assert!(response.via_extension());
    assert_eq!(response.status(), 200);
    assert_eq!(response.body()["routed"], true);
    match &response {
        InterceptedResponse::Extension(envelope) => assert!(envelope.intercepted),
        other => panic!("expected extension path, got {other:?}"),
    }

    let stats = handle.stats_snapshot().await.unwrap();
    let record = &stats["http://example.com/test"];
    assert_eq!(record.count, 1);
    assert_eq!(record.targets[&target_server.uri()], 1);
}

/// Round-robin at the router level: successive requests rotate through the
/// list in order, starting after the cursor.
#[tokio::test]
async fn test_round_robin_rotates_across_requests() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(server)
            .await;
    }

    let runtime = ExtensionRuntime::new();
    let handle = spawn_router(&runtime, Arc::new(MemoryStorage::new())).await;
    handle
        .add_target(Target::new(first.uri(), None, RoutingMode::Roundrobin))
        .await
        .unwrap();
    handle
        .add_target(Target::new(second.uri(), None, RoutingMode::Roundrobin))
        .await
        .unwrap();
    handle.set_mode(RoutingMode::Roundrobin).await.unwrap();

    // Cursor starts at 0 (the reserved target): the first two requests hit
    // the added targets in list order.
    for _ in 0..2 {
        let result = handle
            .execute(
                quefork_interceptor::protocol::ExecuteRequest {
                    url: "http://example.com/rr".to_string(),
                    method: "GET".to_string(),
                    headers: Default::default(),
                    body: None,
                    target_url: None,
                },
                quefork_interceptor::correlation::generate_id(),
            )
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
    }

    let stats = handle.stats_snapshot().await.unwrap();
    let record = &stats["http://example.com/rr"];
    assert_eq!(record.count, 2);
    assert_eq!(record.targets[&first.uri()], 1);
    assert_eq!(record.targets[&second.uri()], 1);
}

/// Extension present but unresponsive: the request resolves through the
/// proxy after the fixed timeout instead of rejecting.
#[tokio::test]
async fn test_unresponsive_extension_falls_back_to_proxy() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow-path"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"via": "proxy"})))
        .mount(&upstream)
        .await;

    let bus = WindowBus::new();
    // Answers probes but never executeRequest: present yet unresponsive.
    {
        let bus = bus.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let WindowMessage::DetectExtension { id } = msg {
                    bus.post(WindowMessage::ExtensionDetected { id });
                }
            }
        });
    }

    let proxy_base = spawn_proxy_server().await;
    let mut config = fast_client_config();
    config.request_timeout = Duration::from_millis(150);
    let client = mount_client(&bus, &proxy_base, config).await;
    wait_until(|| client.has_extension()).await;

    let response = client
        .intercept_request(&RequestDescriptor::get(format!(
            "{}/slow-path",
            upstream.uri()
        )))
        .await
        .unwrap();
    assert!(!response.via_extension());
    assert_eq!(response.body()["via"], "proxy");
}

/// An extension-path error is masked by a successful proxy call; the
/// caller never sees the extension failure.
#[tokio::test]
async fn test_extension_error_masked_by_proxy_fallback() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"saved": true})))
        .mount(&upstream)
        .await;

    let runtime = ExtensionRuntime::new();
    let handle = spawn_router(&runtime, Arc::new(MemoryStorage::new())).await;
    // Route everything at a dead port so the extension path always errors.
    handle
        .add_target(Target::new("http://127.0.0.1:1", None, RoutingMode::Active))
        .await
        .unwrap();
    handle.set_active_target(1).await.unwrap();

    let bus = WindowBus::new();
    let _relay = ContentRelay::spawn(bus.clone(), runtime, fast_relay_config());
    let proxy_base = spawn_proxy_server().await;
    let client = mount_client(&bus, &proxy_base, fast_client_config()).await;
    wait_until(|| client.has_extension()).await;

    let response = client
        .intercept_request(&RequestDescriptor::get(format!("{}/x", upstream.uri())))
        .await
        .unwrap();
    assert!(!response.via_extension());
    assert_eq!(response.body()["saved"], true);
}

/// A late duplicate response for an already-settled correlation id is a
/// no-op; later requests are unaffected.
#[tokio::test]
async fn test_duplicate_response_is_dropped() {
    let bus = WindowBus::new();
    {
        let bus = bus.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                match msg {
                    WindowMessage::DetectExtension { id } => {
                        bus.post(WindowMessage::ExtensionDetected { id });
                    }
                    WindowMessage::FromQuefork(request) => {
                        let envelope = ResponseEnvelope {
                            status: 200,
                            status_text: "OK".to_string(),
                            headers: Default::default(),
                            body: serde_json::json!({"answer": "first"}),
                            content_type: Some("application/json".to_string()),
                            time: "1ms".to_string(),
                            size: "18.00 B".to_string(),
                            intercepted: true,
                        };
                        // Answer twice for the same id.
                        bus.post(WindowMessage::FromExtension(
                            ExtensionReply::execute_response(
                                request.id.clone(),
                                ExecuteResult::ok(envelope.clone()),
                            ),
                        ));
                        bus.post(WindowMessage::FromExtension(
                            ExtensionReply::execute_response(
                                request.id,
                                ExecuteResult::err("duplicate"),
                            ),
                        ));
                    }
                    _ => {}
                }
            }
        });
    }

    let proxy_base = spawn_proxy_server().await;
    let client = mount_client(&bus, &proxy_base, fast_client_config()).await;
    wait_until(|| client.has_extension()).await;

    // First settle wins; the duplicate error never surfaces.
    for _ in 0..3 {
        let response = client
            .intercept_request(&RequestDescriptor::get("http://example.com/dup"))
            .await
            .unwrap();
        assert!(response.via_extension());
        assert_eq!(response.body()["answer"], "first");
    }
}

/// The persisted toggle survives a page reload without extension presence,
/// using the file-backed store.
#[tokio::test]
async fn test_toggle_persists_across_reload_via_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let prefs_path = dir.path().join("page-prefs.json");

    let bus = WindowBus::new();
    {
        let bus = bus.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let WindowMessage::DetectExtension { id } = msg {
                    bus.post(WindowMessage::ExtensionDetected { id });
                }
            }
        });
    }

    {
        let prefs: Arc<dyn ExtensionStorage> =
            Arc::new(JsonFileStorage::open(&prefs_path).await.unwrap());
        let client = InterceptorClient::mount(
            bus.clone(),
            FallbackProxy::new(reqwest::Client::new(), "http://127.0.0.1:1"),
            prefs,
            fast_client_config(),
        )
        .await
        .unwrap();
        wait_until(|| client.has_extension()).await;

        // Default off; toggle on, then off again: the persisted value is
        // the last write.
        assert!(client.toggle_interceptor().await.unwrap());
        assert!(!client.toggle_interceptor().await.unwrap());
    }

    // Reload: a fresh mount on the same store restores the value without
    // waiting for (or needing) extension presence.
    let prefs: Arc<dyn ExtensionStorage> =
        Arc::new(JsonFileStorage::open(&prefs_path).await.unwrap());
    let stored: Option<bool> = storage::load_typed(&*prefs, keys::INTERCEPTOR_ENABLED)
        .await
        .unwrap();
    assert_eq!(stored, Some(false));

    let client = InterceptorClient::mount(
        WindowBus::new(),
        FallbackProxy::new(reqwest::Client::new(), "http://127.0.0.1:1"),
        prefs,
        fast_client_config(),
    )
    .await
    .unwrap();
    assert!(!client.interceptor_enabled());
}

/// Self-test is true only when the extension path actually executed.
#[tokio::test]
async fn test_self_test_reports_extension_execution() {
    let target_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&target_server)
        .await;

    let runtime = ExtensionRuntime::new();
    let handle = spawn_router(&runtime, Arc::new(MemoryStorage::new())).await;
    handle
        .add_target(Target::new(target_server.uri(), None, RoutingMode::Active))
        .await
        .unwrap();
    handle.set_active_target(1).await.unwrap();

    let bus = WindowBus::new();
    let _relay = ContentRelay::spawn(bus.clone(), runtime, fast_relay_config());
    let proxy_base = spawn_proxy_server().await;
    let client = mount_client(&bus, &proxy_base, fast_client_config()).await;
    wait_until(|| client.has_extension()).await;

    assert!(client.self_test().await);

    let stats = handle.stats_snapshot().await.unwrap();
    assert_eq!(stats[SELF_TEST_URL].count, 1);
}

/// Self-test never throws: with no extension and a dead proxy it is just
/// false.
#[tokio::test]
async fn test_self_test_swallows_failures() {
    let bus = WindowBus::new();
    let client = mount_client(&bus, "http://127.0.0.1:1", fast_client_config()).await;
    wait_until(|| client.detection_state() == DetectionState::Absent).await;

    assert!(!client.self_test().await);
}
