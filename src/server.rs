//! HTTP surface: ingress fan-out plus Prometheus metrics and health
//!
//! # Endpoints
//!
//! - `ANY /*` - ingress: the request becomes a record, one copy lands in
//!   every pipeline inbox, the client gets an empty `204`. The reply is
//!   fire-and-forget: it acknowledges the enqueue, not the upstream
//!   delivery.
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /health` - simple liveness check
//!
//! The inbox is the backpressure point: a pipeline whose disk cannot keep
//! up fills its inbox and the handler blocks right here, pushing the wait
//! onto the producer instead of buffering without bound.

use crate::metrics::Metrics;
use crate::queue::QueueWriter;
use crate::record::Record;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PeiliError, Result};

/// Shared state for the ingress server
pub struct AppState {
    /// One inbox per endpoint pipeline, in registration order
    pub inboxes: Vec<QueueWriter>,
    /// Ingress body limit, same number the queues enforce
    pub max_body_bytes: usize,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .fallback(ingress_handler)
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
pub async fn serve(addr: SocketAddr, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Handler for every non-reserved path: read, record, fan out, ack.
async fn ingress_handler(State(state): State<Arc<AppState>>, request: Request) -> impl IntoResponse {
    if let Some(m) = Metrics::get() {
        m.requests.inc();
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Some(m) = Metrics::get() {
                m.failures.inc();
            }
            debug!(error = %e, "rejecting unreadable or oversized body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned());
    let record = Record::new(parts.method.as_str(), url, bytes);

    // All pipelines accept or the handler blocks on the slow one; the
    // client never observes a partial fan-out.
    for inbox in &state.inboxes {
        match inbox.enqueue(record.clone()).await {
            Ok(()) => {}
            Err(e @ PeiliError::OversizedRecord { .. }) => {
                if let Some(m) = Metrics::get() {
                    m.failures.inc();
                }
                debug!(error = %e, "rejecting out-of-bounds record");
                return StatusCode::BAD_REQUEST;
            }
            Err(e) => {
                if let Some(m) = Metrics::get() {
                    m.failures.inc();
                }
                warn!(endpoint = inbox.name(), error = %e, "inbox closed, refusing request");
                return StatusCode::SERVICE_UNAVAILABLE;
            }
        }
    }

    StatusCode::NO_CONTENT
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
