//! # Operator API
//!
//! Builds the axum router for the node's read-only HTTP interface. All
//! endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path      | Description                                  |
//! |--------|-----------|----------------------------------------------|
//! | GET    | `/health` | Liveness check                               |
//! | GET    | `/status` | Order counts, last sequence number, rate     |
//! | GET    | `/ws`     | WebSocket stream of transmission events      |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use skycast_protocol::notify::Envelope;
use skycast_protocol::BroadcastQueue;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: everything behind `Arc` or a channel handle.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// Channel capacity the scheduler runs at, in bytes per second.
    pub transmit_rate: u64,
    /// Order and invoice service.
    pub queue: Arc<BroadcastQueue>,
    /// Event bus the queue publishes into.
    pub events: broadcast::Sender<Envelope>,
    /// Reference to Prometheus metrics for in-handler sampling.
    pub metrics: SharedMetrics,
}

/// Response body for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    /// Number of orders in each status.
    pub orders: BTreeMap<String, usize>,
    /// Highest sequence number assigned so far.
    pub last_tx_seq_num: Option<u64>,
    /// Channel capacity in bytes per second.
    pub transmit_rate: u64,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` returns 200 while the process is up.
///
/// Liveness only. Storage health belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let last_tx_seq_num = match state.queue.last_tx_seq_num() {
        Ok(seq) => seq,
        Err(e) => {
            tracing::error!(error = %e, "status: failed to read sequence numbers");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "code": e.code(), "error": e.to_string() })),
            )
                .into_response();
        }
    };

    state.metrics.observe_queue(&state.queue);

    let orders = state
        .queue
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();

    Json(StatusResponse {
        version: state.version.clone(),
        orders,
        last_tx_seq_num,
        transmit_rate: state.transmit_rate,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
    .into_response()
}

/// `GET /ws` upgrades to a push-only WebSocket.
///
/// Clients receive every [`Envelope`] the queue publishes, JSON-encoded.
/// Client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Forwards broadcast events until the client disconnects or the bus closes.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(envelope) => {
                        let payload = match serde_json::to_string(&envelope) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}
