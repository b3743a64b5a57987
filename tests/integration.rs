//! Integration tests for the HTTP surface.
//!
//! Most tests drive the axum router in-process against the scripted
//! control-port double from `torwatch::test_utils`. The `live_tor` module
//! talks to a real Tor instance and is ignored by default.
//!
//! # Running the live tests
//!
//! ```sh
//! TOR_CONTROL_PORT=127.0.0.1:9051 TOR_PASSWORD=test cargo test --test integration -- --ignored
//! ```

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use torwatch::egress::{EgressVerifier, ProbeClient, ProbeError};
use torwatch::server::{self, AppState};
use torwatch::test_utils::{MockControlServer, MockTor, RecordingMetrics, RecordingNotifier};
use torwatch::{EventKind, PrometheusMetrics, SidecarConfig};

struct Harness {
    tor: MockTor,
    server: MockControlServer,
    notifier: Arc<RecordingNotifier>,
    metrics: Arc<RecordingMetrics>,
    state: AppState,
}

impl Harness {
    async fn start(tor: MockTor) -> Self {
        let server = MockControlServer::start(tor.clone()).await.unwrap();
        let config = SidecarConfig::new().control_address(server.address());
        let notifier = Arc::new(RecordingNotifier::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let state = AppState::new(&config, notifier.clone(), metrics.clone());

        Self {
            tor,
            server,
            notifier,
            metrics,
            state,
        }
    }

    async fn request(&self, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = server::router(self.state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri).await
    }
}

/// Probe double that answers every URL with the same body.
struct FixedProbe(Result<String, ProbeError>);

#[async_trait]
impl ProbeClient for FixedProbe {
    async fn fetch(&self, _: &str) -> Result<String, ProbeError> {
        self.0.clone()
    }
}

fn verifier_with(probe: FixedProbe, metrics: Arc<RecordingMetrics>) -> EgressVerifier {
    EgressVerifier::new(
        ["https://check.torproject.org/api/ip"],
        torwatch::config::DEFAULT_PROXY_URL,
        Duration::from_secs(1),
        metrics,
    )
    .with_probe(Arc::new(probe))
}

// ============================================================================
// Liveness and Readiness
// ============================================================================

mod health {
    use super::*;

    #[tokio::test]
    async fn test_ping_has_no_dependencies() {
        let harness = Harness::start(MockTor::new(0)).await;
        let (status, body) = harness.get("/ping").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"status": "OK"}));
        assert_eq!(harness.server.connections(), 0);
    }

    #[tokio::test]
    async fn test_health_ready_and_not_ready() {
        let harness = Harness::start(MockTor::new(100)).await;

        let (status, body) = harness.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "READY");

        harness.tor.set_bootstrap(60);
        let (status, body) = harness.get("/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "NOT_READY");
        assert_eq!(body["error"], "tor not ready");

        let kinds: Vec<EventKind> = harness.notifier.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::HealthChanged]);
        assert_eq!(harness.metrics.ready(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_health_when_control_port_down() {
        let harness = Harness::start(MockTor::new(100)).await;
        harness.tor.drop_next_command();

        let (status, body) = harness.get("/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "NOT_READY");

        let events = harness.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::BootstrapFailed);
        assert!(events[0].details.error.is_some());

        // The next check reconnects and recovers.
        let (status, _) = harness.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(harness.server.connections(), 2);
        assert_eq!(harness.notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn test_requests_are_instrumented() {
        let harness = Harness::start(MockTor::new(100)).await;
        harness.get("/ping").await;
        harness.get("/health").await;

        assert_eq!(
            harness.metrics.requests(),
            vec![
                ("/ping".to_string(), "GET".to_string(), 200),
                ("/health".to_string(), "GET".to_string(), 200),
            ]
        );
    }
}

// ============================================================================
// Egress Verification
// ============================================================================

mod egress {
    use super::*;

    #[tokio::test]
    async fn test_ready_when_verified() {
        let harness = Harness::start(MockTor::new(100)).await;
        let verifier = verifier_with(
            FixedProbe(Ok(r#"{"IsTor":true,"IP":"185.220.101.1"}"#.to_string())),
            harness.metrics.clone(),
        );
        let harness = Harness {
            state: harness.state.clone().with_egress(verifier),
            ..harness
        };

        let (status, body) = harness.get("/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["is_tor"], true);
        assert_eq!(body["ip"], "185.220.101.1");
        assert_eq!(body["endpoint"], "https://check.torproject.org/api/ip");
        assert_eq!(
            harness.metrics.checks(),
            vec![("https://check.torproject.org/api/ip".to_string(), true, true)]
        );
    }

    #[tokio::test]
    async fn test_not_ready_when_not_tor() {
        let harness = Harness::start(MockTor::new(100)).await;
        let verifier = verifier_with(
            FixedProbe(Ok(r#"{"IsTor":false,"IP":"203.0.113.7"}"#.to_string())),
            harness.metrics.clone(),
        );
        let harness = Harness {
            state: harness.state.clone().with_egress(verifier),
            ..harness
        };

        let (status, body) = harness.get("/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert_eq!(body["is_tor"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("all endpoints failed"));
    }
}

// ============================================================================
// Status and Renewal
// ============================================================================

mod status {
    use super::*;

    #[tokio::test]
    async fn test_status_snapshot() {
        let harness = Harness::start(MockTor::new(100)).await;
        let (status, body) = harness.get("/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["version"], "0.4.8.12");
        assert_eq!(body["bootstrap_phase"], 100);
        assert_eq!(body["circuit_established"], true);
        assert_eq!(body["num_circuits"], 3);
        assert_eq!(body["traffic"]["bytes_read"], 1024);
        assert_eq!(body["traffic"]["bytes_written"], 2048);
        assert_eq!(harness.metrics.statuses().len(), 1);
    }

    #[tokio::test]
    async fn test_status_error() {
        let harness = Harness::start(MockTor::new(100)).await;
        harness.tor.fail_getinfo(true);

        let (status, body) = harness.get("/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "ERROR");
        assert!(body["error"].as_str().unwrap().contains("551"));
    }

    #[tokio::test]
    async fn test_renew() {
        let harness = Harness::start(MockTor::new(100)).await;
        let (status, body) = harness.request(Method::POST, "/renew").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["message"], "Signal NEWNYM sent");
        assert!(harness
            .server
            .commands()
            .contains(&"SIGNAL NEWNYM".to_string()));

        let events = harness.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::CircuitRenewed);
        assert_eq!(events[0].details.circuits, 3);
    }

    #[tokio::test]
    async fn test_renew_failure() {
        let harness = Harness::start(MockTor::new(100)).await;
        harness.tor.reject_signals(true);

        let (status, body) = harness.request(Method::POST, "/renew").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("552"));
        assert!(harness.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_renew_requires_post() {
        let harness = Harness::start(MockTor::new(100)).await;
        let (status, _) = harness.get("/renew").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(harness.server.commands().is_empty());
    }
}

// ============================================================================
// Metrics Exposition
// ============================================================================

mod exposition {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint_renders_prometheus_text() {
        let tor = MockTor::new(100);
        let mock = MockControlServer::start(tor).await.unwrap();
        let config = SidecarConfig::new().control_address(mock.address());
        let exporter = Arc::new(PrometheusMetrics::new().unwrap());
        let state = AppState::new(
            &config,
            Arc::new(RecordingNotifier::default()),
            exporter.clone(),
        )
        .with_exporter(exporter);

        let app = server::router(state);
        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("torwatch_tor_ready 1"));
        assert!(text.contains("torwatch_tor_bootstrap_percent 100"));
        assert!(text.contains("torwatch_http_requests_total"));
    }

    #[tokio::test]
    async fn test_metrics_without_exporter() {
        let harness = Harness::start(MockTor::new(100)).await;
        let (status, _) = harness.get("/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

// ============================================================================
// Graceful Shutdown
// ============================================================================

mod shutdown {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_serve_stops_and_closes_link() {
        let harness = Harness::start(MockTor::new(100)).await;
        harness.state.link().connect().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(server::serve(listener, harness.state.clone(), token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!harness.state.link().is_connected().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(harness.server.commands().contains(&"QUIT".to_string()));
    }

    /// Probe double that never answers.
    struct HangingProbe;

    #[async_trait]
    impl ProbeClient for HangingProbe {
        async fn fetch(&self, _: &str) -> Result<String, ProbeError> {
            std::future::pending::<Result<String, ProbeError>>().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_stuck_probe() {
        use tokio::io::AsyncWriteExt;

        let harness = Harness::start(MockTor::new(100)).await;
        let verifier = EgressVerifier::new(
            ["https://check.torproject.org/api/ip"],
            torwatch::config::DEFAULT_PROXY_URL,
            Duration::from_secs(60),
            harness.metrics.clone(),
        )
        .with_probe(Arc::new(HangingProbe));
        let state = harness.state.clone().with_egress(verifier);
        harness.state.link().connect().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(server::serve_with_grace(
            listener,
            state,
            token.clone(),
            Duration::from_millis(200),
        ));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /ready HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("serve kept waiting for the stuck request")
            .unwrap()
            .unwrap();

        assert!(!harness.state.link().is_connected().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(harness.server.commands().contains(&"QUIT".to_string()));
    }
}

// ============================================================================
// Live Tor (ignored by default)
// ============================================================================

mod live_tor {
    use super::*;
    use torwatch::{ControlConfig, ControlLink, Signal, StatusReader};

    fn control_addr() -> String {
        std::env::var("TOR_CONTROL_PORT").unwrap_or_else(|_| "127.0.0.1:9051".to_string())
    }

    fn live_link() -> Arc<ControlLink> {
        Arc::new(ControlLink::new(&ControlConfig {
            address: control_addr(),
            password: std::env::var("TOR_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            ..ControlConfig::default()
        }))
    }

    #[tokio::test]
    #[ignore = "requires a running Tor instance"]
    async fn test_live_status() {
        let reader = StatusReader::new(live_link());
        let snapshot = reader.get_status().await.unwrap();

        assert!(!snapshot.version.is_empty(), "Should report a version");
        assert!(snapshot.bootstrap_phase <= 100);
        println!("Tor {} at {}%", snapshot.version, snapshot.bootstrap_phase);
    }

    #[tokio::test]
    #[ignore = "requires a running Tor instance"]
    async fn test_live_newnym() {
        let link = live_link();
        link.signal(Signal::NewNym).await.unwrap();
        link.close().await;
    }
}
