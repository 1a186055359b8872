//! Axum HTTP and WebSocket endpoint for subscribers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use relay_core::{DataSource, PeerId, RelayError};
use relay_telemetry::{
    HistogramSummary, MetricsRecorder, ACKS_MISSED_TOTAL, ACKS_TOTAL, ACK_LATENCY_MS,
    ENVELOPES_SENT_TOTAL, SEND_FAILURES_TOTAL,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::broadcast::BroadcastEngine;
use crate::cadence;
use crate::config::HubConfig;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::socket;

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BroadcastEngine>,
    pub config: Arc<HubConfig>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub start_time: Instant,
}

/// Query string of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub rounds: u64,
    pub uptime_secs: u64,
    /// Present when the hub records metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySummary>,
}

/// Delivery counters and ack latency from the metrics recorder.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub envelopes_sent: u64,
    pub send_failures: u64,
    pub acks: u64,
    pub acks_missed: u64,
    pub ack_latency_ms: HistogramSummary,
}

impl DeliverySummary {
    fn from_recorder(m: &MetricsRecorder) -> Self {
        Self {
            envelopes_sent: m.counter_get(ENVELOPES_SENT_TOTAL, &[]),
            send_failures: m.counter_get(SEND_FAILURES_TOTAL, &[]),
            acks: m.counter_get(ACKS_TOTAL, &[]),
            acks_missed: m.counter_get(ACKS_MISSED_TOTAL, &[]),
            ack_latency_ms: m.histogram_summary(ACK_LATENCY_MS, &[]),
        }
    }
}

/// The hub: session registry, broadcast engine and HTTP listener.
pub struct HubServer {
    config: Arc<HubConfig>,
    engine: Arc<BroadcastEngine>,
    metrics: Option<Arc<MetricsRecorder>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl HubServer {
    pub fn new(config: HubConfig, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self::with_shutdown(config, metrics, Arc::new(ShutdownCoordinator::new()))
    }

    /// Build a hub whose sessions and cadence stop with `shutdown`.
    pub fn with_shutdown(
        config: HubConfig,
        metrics: Option<Arc<MetricsRecorder>>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(shutdown.child_token(), metrics.clone()));
        let engine = Arc::new(BroadcastEngine::new(
            registry,
            config.ack_timeout(),
            metrics.clone(),
        ));
        Self {
            config: Arc::new(config),
            engine,
            metrics,
            shutdown,
            start_time: Instant::now(),
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: Arc::clone(&self.engine),
            config: Arc::clone(&self.config),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Bind failure is the only fatal hub error.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), RelayError> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, path = %self.config.path, "hub listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                warn!(error = %e, "hub server exited with error");
            }
        });
        Ok((addr, handle))
    }

    /// Start the periodic broadcast loop against `source`.
    pub fn spawn_cadence(&self, source: Arc<dyn DataSource>) -> JoinHandle<()> {
        tokio::spawn(cadence::run_cadence(
            Arc::clone(&self.engine),
            source,
            self.config.broadcast_interval(),
            self.shutdown.child_token(),
        ))
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}

/// GET /ws?clientId=...
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(peer) = params
        .client_id
        .filter(|id| !id.trim().is_empty())
        .map(PeerId::from_raw)
    else {
        return (StatusCode::BAD_REQUEST, "missing clientId").into_response();
    };

    let engine = Arc::clone(&state.engine);
    let queue = state.config.max_send_queue;
    let heartbeat = state.config.heartbeat_interval();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| socket::serve_peer(socket, peer, engine, queue, heartbeat))
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        connections: state.engine.registry().len(),
        rounds: state.engine.rounds_started(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        delivery: state.metrics.as_deref().map(DeliverySummary::from_recorder),
    })
}
