// Edge Tunnel Manager - REST API Module
// Handles HTTP API endpoints for tunnel control

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};

// SSE plumbing for /api/events
use axum::response::sse::Event;
use axum::response::Sse;
use futures::{stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use edge_tunnel_common::types::{CreatedTunnel, ManagedTunnel, QuickTunnel, TunnelEvent};
use edge_tunnel_common::Error;

use crate::manager::TunnelManager;

/// Shared application state
pub struct AppState {
    pub manager: TunnelManager,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    /// Set when a create saga failed after the remote tunnel was created
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel_id: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            tunnel_id: None,
        }
    }
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

/// Full record listing
#[derive(Serialize)]
struct TunnelsListResponse {
    managed: Vec<ManagedTunnel>,
    quick: Vec<QuickTunnel>,
}

#[derive(Deserialize)]
struct CreateTunnelRequest {
    name: String,
    hostname: String,
    local_port: u16,
    /// Optional companion web-server URL for the ingress rule; defaults
    /// to http://localhost:<local_port>
    #[serde(default)]
    service: Option<String>,
}

#[derive(Deserialize)]
struct StopParams {
    /// When false, only signal the process; the exit report finishes the
    /// transition
    #[serde(default = "default_sync")]
    sync: bool,
}

fn default_sync() -> bool {
    true
}

#[derive(Deserialize)]
struct QuickTunnelRequest {
    local_url: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    live_processes: usize,
}

/// Heartbeat frame interleaved into the SSE stream
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HeartbeatEvent {
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels", post(create_tunnel))
        .route("/api/tunnels/:name/start", post(start_tunnel))
        .route("/api/tunnels/:name/stop", post(stop_tunnel))
        .route("/api/tunnels/:name/toggle", post(toggle_tunnel))
        .route("/api/tunnels/:name/status", get(tunnel_status))
        .route("/api/tunnels/:name", delete(delete_tunnel))
        .route("/api/quick", post(start_quick))
        .route("/api/quick/:id", delete(stop_quick))
        .route("/api/rescan", post(rescan))
        .route("/api/stop-all", post(stop_all))
        .route("/api/login", post(login))
        .route("/api/events", get(event_stream))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Map domain errors to HTTP responses
fn error_response(e: Error) -> axum::response::Response {
    let status = match &e {
        Error::TunnelNotFound(_) => StatusCode::NOT_FOUND,
        Error::TunnelExists(_) | Error::AlreadyRunning(_) | Error::NotRunning(_) => {
            StatusCode::CONFLICT
        }
        Error::ExecutableMissing(_) => StatusCode::FAILED_DEPENDENCY,
        Error::Gateway(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = ErrorResponse::new(e.to_string());
    if let Error::SagaLocalWrite { tunnel_id, .. } = &e {
        body.tunnel_id = Some(tunnel_id.clone());
    }
    (status, Json(body)).into_response()
}

/// Health check endpoint
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        live_processes: state.manager.live_process_count(),
    })
}

/// List all managed and quick tunnel records
async fn list_tunnels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(TunnelsListResponse {
        managed: state.manager.list_managed().await,
        quick: state.manager.list_quick().await,
    })
}

/// Create a new managed tunnel (remote create + DNS route + local config)
async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTunnelRequest>,
) -> impl IntoResponse {
    info!("API: Create tunnel request for {}", req.name);

    match state
        .manager
        .create_managed(
            &req.name,
            &req.hostname,
            req.local_port,
            req.service.as_deref(),
        )
        .await
    {
        Ok(created) => (StatusCode::CREATED, Json::<CreatedTunnel>(created)).into_response(),
        Err(e) => {
            error!("Failed to create tunnel {}: {}", req.name, e);
            error_response(e)
        }
    }
}

/// Start a managed tunnel
async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    info!("API: Start tunnel request for {}", name);

    match state.manager.start_managed(&name).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SuccessResponse {
                message: format!("Tunnel {} starting", name),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start tunnel {}: {}", name, e);
            error_response(e)
        }
    }
}

/// Stop a managed tunnel: bounded synchronous stop by default,
/// signal-only with `?sync=false`
async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<StopParams>,
) -> impl IntoResponse {
    info!("API: Stop tunnel request for {} (sync={})", name, params.sync);

    let result = if params.sync {
        state.manager.stop_managed(&name).await
    } else {
        state.manager.request_stop(&name).await
    };

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: if params.sync {
                    format!("Tunnel {} stopped", name)
                } else {
                    format!("Tunnel {} stopping", name)
                },
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop tunnel {}: {}", name, e);
            error_response(e)
        }
    }
}

/// Start the tunnel when stopped, stop it when active
async fn toggle_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.manager.toggle_managed(&name).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: format!("Tunnel {} toggled", name),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Get one managed tunnel's record
async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_managed(&name).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Delete a managed tunnel (stop + remote delete + config removal)
async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    info!("API: Delete tunnel request for {}", name);

    match state.manager.delete_managed(&name).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: format!("Tunnel {} deleted", name),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to delete tunnel {}: {}", name, e);
            error_response(e)
        }
    }
}

/// Start an ephemeral quick tunnel for a local URL
async fn start_quick(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QuickTunnelRequest>,
) -> impl IntoResponse {
    info!("API: Quick tunnel request for {}", req.local_url);

    match state.manager.start_quick(&req.local_url).await {
        Ok(record) => (StatusCode::ACCEPTED, Json(record)).into_response(),
        Err(e) => {
            error!("Failed to start quick tunnel: {}", e);
            error_response(e)
        }
    }
}

/// Stop a quick tunnel by instance id
async fn stop_quick(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.manager.stop_quick(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: format!("Quick tunnel {} stopping", id),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Force a rescan of the config directory
async fn rescan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.rescan().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SuccessResponse {
                message: "Rescan complete".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Stop every active tunnel
async fn stop_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.manager.stop_all().await;
    Json(SuccessResponse {
        message: format!("Stopped {} tunnel(s)", stopped),
    })
}

/// Run the control-plane login flow
async fn login(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.login().await {
        Ok(output) => (
            StatusCode::OK,
            Json(SuccessResponse { message: output }),
        )
            .into_response(),
        Err(e) => {
            error!("Login failed: {}", e);
            error_response(e)
        }
    }
}

/// GET /api/events  → SSE stream of tunnel events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    // Broadcast events from the manager
    let tunnel_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(ev) => {
                let json = match serde_json::to_string::<TunnelEvent>(&ev) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {e}");
                        return None;
                    }
                };
                Some(Ok(Event::default().data(json)))
            }
            Err(lagged) => {
                // Slow clients miss events and catch up with the next ones
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    // Heartbeat stream to keep connections warm and allow clients to detect liveness
    let heartbeat_stream = heartbeat_stream();

    // Merge tunnel events and heartbeats
    let merged = stream::select(tunnel_events, heartbeat_stream);

    // Take events until shutdown signal is received
    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&HeartbeatEvent::Heartbeat {
        timestamp: Utc::now(),
    }) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        // With the test interval override a heartbeat must show up well within 1s
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[test]
    fn saga_failures_expose_the_created_id() {
        let response = ErrorResponse {
            error: "local write failed".to_string(),
            tunnel_id: Some("abc-123".to_string()),
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert!(json.contains("\"tunnel_id\":\"abc-123\""));

        let bare = ErrorResponse::new("not found");
        let json = serde_json::to_string(&bare).expect("serialize");
        assert!(!json.contains("tunnel_id"));
    }
}
