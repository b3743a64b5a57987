//! HTTP surface.
//!
//! | Route          | Purpose                                   |
//! |----------------|-------------------------------------------|
//! | `GET /ping`    | liveness, no dependencies                 |
//! | `GET /health`  | bootstrap readiness, drives notifications |
//! | `GET /ready`   | egress verification through the proxy     |
//! | `GET /status`  | full status snapshot                      |
//! | `POST /renew`  | `SIGNAL NEWNYM`                           |
//! | `GET /metrics` | Prometheus exposition                     |

use crate::config::SidecarConfig;
use crate::egress::EgressVerifier;
use crate::error::{ControlError, NotifyError};
use crate::link::ControlLink;
use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::notify::{Dispatcher, EventDetails, EventKind, NotificationEvent, Notify};
use crate::readiness::ReadinessEvaluator;
use crate::status::{StatusReader, StatusSnapshot};
use crate::types::Signal;

use axum::extract::{MatchedPath, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that stop the server from starting or running.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The Prometheus registry rejected a collector.
    #[error("registering metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The webhook client could not be built.
    #[error("building webhook client: {0}")]
    Notify(#[from] NotifyError),

    /// The listen address is unavailable.
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The accept loop failed.
    #[error("HTTP server exited abnormally: {0}")]
    Serve(std::io::Error),
}

/// Shared dependencies of every handler.
#[derive(Clone)]
pub struct AppState {
    link: Arc<ControlLink>,
    status: StatusReader,
    readiness: Arc<ReadinessEvaluator>,
    egress: Arc<EgressVerifier>,
    notifier: Arc<dyn Notify>,
    metrics: Arc<dyn MetricsSink>,
    exporter: Option<Arc<PrometheusMetrics>>,
}

impl AppState {
    /// Wire up the production stack: Prometheus sink and webhook dispatcher.
    pub fn from_config(config: &SidecarConfig) -> Result<Self, ServerError> {
        let exporter = Arc::new(PrometheusMetrics::new()?);
        let metrics: Arc<dyn MetricsSink> = exporter.clone();
        let dispatcher = Dispatcher::from_config(&config.webhook, Arc::clone(&metrics))?;

        if dispatcher.is_enabled() {
            info!(
                format = %config.webhook.format,
                events = config.webhook.events.len(),
                "webhook notifications enabled"
            );
        }

        Ok(Self::new(config, Arc::new(dispatcher), metrics).with_exporter(exporter))
    }

    /// Wire up with caller-provided notifier and metrics sink.
    pub fn new(
        config: &SidecarConfig,
        notifier: Arc<dyn Notify>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let link = Arc::new(ControlLink::new(&config.control));
        let status = StatusReader::new(Arc::clone(&link));
        let readiness = ReadinessEvaluator::new(
            status.clone(),
            Arc::clone(&notifier),
            Arc::clone(&metrics),
        );
        let egress = EgressVerifier::new(
            config.external_endpoints.iter().cloned(),
            config.proxy_url.clone(),
            config.external_timeout,
            Arc::clone(&metrics),
        );

        Self {
            link,
            status,
            readiness: Arc::new(readiness),
            egress: Arc::new(egress),
            notifier,
            metrics,
            exporter: None,
        }
    }

    /// Serve `/metrics` from `exporter`.
    pub fn with_exporter(mut self, exporter: Arc<PrometheusMetrics>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Replace the egress verifier.
    pub fn with_egress(mut self, egress: EgressVerifier) -> Self {
        self.egress = Arc::new(egress);
        self
    }

    /// The shared control link.
    pub fn link(&self) -> &Arc<ControlLink> {
        &self.link
    }
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/renew", post(renew))
        .route_layer(middleware::from_fn(instrument))
        .route("/metrics", get(metrics))
        .layer(Extension(state))
}

/// How long in-flight requests may keep running once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Serve on `listener` until `shutdown` fires, then close the control link.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    serve_with_grace(listener, state, shutdown, SHUTDOWN_GRACE).await
}

/// Like [`serve`], but abandons in-flight requests `grace` after
/// `shutdown` fires. The control link is closed either way.
pub async fn serve_with_grace(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<(), ServerError> {
    let link = Arc::clone(state.link());

    if let Ok(addr) = listener.local_addr() {
        info!("health server listening on {}", addr);
    }

    let drain_signal = shutdown.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            drain_signal.cancelled().await;
        })
        .into_future();

    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    let result = tokio::select! {
        result = server => result.map_err(ServerError::Serve),
        _ = deadline => {
            warn!(grace = ?grace, "requests still in flight after shutdown grace, abandoning them");
            Ok(())
        }
    };

    info!("health server stopped, closing tor control connection");
    link.close().await;

    result
}

/// Bind `0.0.0.0:<http_port>` and serve the production stack.
pub async fn run(config: &SidecarConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    let state = AppState::from_config(config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    serve(listener, state, shutdown).await
}

async fn instrument(
    Extension(state): Extension<AppState>,
    matched: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let path = matched
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    info!(%method, %path, status, duration = ?elapsed, "request handled");
    state.metrics.http_request(&path, &method, status, elapsed);

    response
}

async fn ping() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "OK" })))
}

async fn health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    if state.readiness.evaluate().await.ready {
        (StatusCode::OK, Json(json!({ "status": "READY" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "NOT_READY", "error": "tor not ready" })),
        )
    }
}

async fn ready(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let result = state.egress.check().await;
    let code = if result.success && result.is_tor {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(result))
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    #[serde(flatten)]
    snapshot: StatusSnapshot,
}

async fn status(Extension(state): Extension<AppState>) -> Response {
    match state.status.get_status().await {
        Ok(snapshot) => {
            state.metrics.tor_status(&snapshot);
            (
                StatusCode::OK,
                Json(StatusBody {
                    status: "OK",
                    snapshot,
                }),
            )
                .into_response()
        }
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "ERROR", "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn renew(Extension(state): Extension<AppState>) -> impl IntoResponse {
    match renew_circuit(&state.status, state.notifier.as_ref()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "OK", "message": "Signal NEWNYM sent" })),
        ),
        Err(err) => {
            error!(error = %err, "failed to send NEWNYM");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
        }
    }
}

async fn metrics(Extension(state): Extension<AppState>) -> Response {
    let Some(exporter) = &state.exporter else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match exporter.render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Send `SIGNAL NEWNYM`, then announce it with fresh circuit details.
///
/// The notification is skipped when the follow-up status query fails.
pub async fn renew_circuit(
    reader: &StatusReader,
    notifier: &dyn Notify,
) -> Result<(), ControlError> {
    reader.link().signal(Signal::NewNym).await?;
    info!("NEWNYM signal sent");

    match reader.get_status().await {
        Ok(snapshot) => notifier.notify(NotificationEvent::new(
            EventKind::CircuitRenewed,
            "Tor circuit renewal requested",
            EventDetails {
                circuits: snapshot.num_circuits,
                healthy: snapshot.circuit_established,
                ..EventDetails::default()
            },
        )),
        Err(err) => warn!(
            error = %err,
            "failed to get tor status after NEWNYM, skipping circuit renewal webhook"
        ),
    }

    Ok(())
}
