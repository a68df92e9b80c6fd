//! ==============================================================================
//! server.rs - http api and websocket endpoint
//! ==============================================================================
//!
//! routes:
//!     POST /api/scan                     scanner batch ingest
//!     GET  /api/devices                  device list with rssi average
//!     GET  /api/devices/:mac/readings    newest readings of one device
//!     GET  /api/health                   liveness + a few counters
//!     GET  /ws                           realtime `scan:batch` feed
//!
//! request flow for POST /api/scan:
//!
//! ```text
//!     body ──► ingest::parse_batch ──► ingest::normalize ──► store.apply_batch
//!                 (4xx on reject)                              (one transaction)
//!                                                                    │
//!                                            hub.publish(scan:batch) ◄┘ on commit
//! ```
//!
//! relationships:
//!     - used by: main.rs (run_server), tests/ (build_router)
//!     - uses: ingest.rs, store.rs, hub.rs, error.rs
//!
//! ==============================================================================

use crate::config::{HubConfig, IngestConfig};
use crate::domain::{DeviceSummary, HubEvent, ReadingRecord, ScanAck};
use crate::error::ApiError;
use crate::hub::{self, Hub};
use crate::ingest::{self, NormalizedBatch};
use crate::store::{ScanStore, StoreError};

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{ws::WebSocketUpgrade, DefaultBodyLimit, Path, State},
    http::{Method, Request},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

// ==============================================================================
// shared state
// ==============================================================================
// handlers get the store and the hub injected through axum state rather than
// reaching for globals, so tests can run the router against any ScanStore.

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ScanStore>,
    pub hub: Hub,
    pub limits: IngestConfig,
    pub log_batches: bool,
}

impl AppState {
    pub fn new(store: Arc<dyn ScanStore>, hub: Hub, config: &HubConfig) -> Self {
        Self {
            store,
            hub,
            limits: config.ingest.clone(),
            log_batches: config.logging.log_batches,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.limits.max_body_bytes;
    Router::new()
        .route("/api/scan", post(scan_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/:mac/readings", get(readings_handler))
        .route("/api/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(log_aborted_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the listener and serve until ctrl-c.
pub async fn run_server(config: &HubConfig, state: AppState) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %listener.local_addr()?, "hub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ==============================================================================
// handlers
// ==============================================================================

/// POST /api/scan
///
/// Accepts one observation object or an array of them. The answer counts
/// every received item and lists the ones that were skipped.
async fn scan_handler(
    State(state): State<AppState>,
    body: Result<Bytes, axum::extract::rejection::BytesRejection>,
) -> Result<Json<ScanAck>, ApiError> {
    let body = body?;
    let items = ingest::parse_batch(&body, state.limits.max_batch).map_err(|e| {
        warn!(error = %e, bytes = body.len(), "rejected scan request");
        e
    })?;

    let now = now_ms();
    let received = items.len();
    let batch = ingest::normalize(&items, now);

    let NormalizedBatch { observations, views, mut skipped } = batch;
    let store = state.store.clone();
    let hub = state.hub.clone();

    // commit and publish run as one unit on the blocking pool, so a client
    // hanging up mid-request can't leave a committed batch unbroadcast.
    // only committed batches reach the dashboards.
    let (outcome, subscribers) = tokio::task::spawn_blocking(move || {
        let outcome = store.apply_batch(&observations, now)?;
        let subscribers = hub.publish(HubEvent::ScanBatch(views));
        Ok::<_, StoreError>((outcome, subscribers))
    })
    .await??;

    skipped.extend(outcome.skipped);
    skipped.sort_by_key(|s| s.index);

    if state.log_batches {
        info!(
            received,
            stored = outcome.stored,
            skipped = skipped.len(),
            subscribers,
            "scan batch accepted"
        );
    }

    Ok(Json(ScanAck {
        status: "OK".to_string(),
        received,
        stored: outcome.stored,
        skipped,
    }))
}

/// GET /api/devices
async fn devices_handler(State(state): State<AppState>) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    let store = state.store.clone();
    let devices = tokio::task::spawn_blocking(move || store.list_devices()).await??;
    Ok(Json(devices))
}

/// GET /api/devices/:mac/readings
async fn readings_handler(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Vec<ReadingRecord>>, ApiError> {
    let store = state.store.clone();
    let limit = state.limits.readings_limit;
    let readings = tokio::task::spawn_blocking(move || store.device_readings(&mac, limit)).await??;
    Ok(Json(readings))
}

/// GET /api/health
async fn health_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let devices = tokio::task::spawn_blocking(move || store.device_count()).await??;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "devices": devices,
        "subscribers": state.hub.subscriber_count(),
    })))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| hub::serve_socket(socket, state.hub))
}

// ==============================================================================
// middleware
// ==============================================================================
// hyper drops the handler future when the client hangs up mid-request. the
// guard below notices the drop and logs it. work already handed to
// spawn_blocking (the ingest transaction and its broadcast) still runs to
// completion.

struct InFlight {
    method: Method,
    path: String,
    finished: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            warn!(method = %self.method, path = %self.path, "request aborted by client");
        }
    }
}

async fn log_aborted_requests(request: Request<Body>, next: Next) -> Response {
    let mut guard = InFlight {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        finished: false,
    };
    let response = next.run(request).await;
    guard.finished = true;
    response
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
