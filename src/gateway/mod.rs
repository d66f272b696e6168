//! HTTP control surface: status, start/stop, AI toggle, health, live events
//! and the dashboard's static files.

pub mod sse;
pub mod static_files;

use crate::connection::ConnectionSupervisor;
use crate::health;
use crate::pipeline::MessagePipeline;
use crate::status_events::{StatusHub, StatusPayload};
use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

/// Requests carry no meaningful bodies; anything larger is refused.
const MAX_BODY_SIZE: usize = 64 * 1024;

const HEALTH_COMPONENT: &str = "gateway";

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub pipeline: Arc<MessagePipeline>,
    pub hub: Arc<StatusHub>,
    pub web_dir: Option<Arc<PathBuf>>,
}

impl AppState {
    pub fn status_payload(&self) -> StatusPayload {
        let snapshot = self.supervisor.snapshot();
        StatusPayload {
            status: snapshot.state,
            qr: snapshot.challenge,
            error: snapshot.last_error,
            session_id: snapshot.session_id,
        }
    }
}

/// Build the axum router with all gateway routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(handle_banner))
        .route("/api/status", get(handle_status))
        .route("/api/start", post(handle_start))
        .route("/api/stop", post(handle_stop))
        .route("/api/toggle-ai", post(handle_toggle_ai))
        .route("/api/events", get(sse::handle_sse_events))
        .route("/health", get(handle_health))
        .fallback(static_files::handle_fallback)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state)
}

/// Bind `host:port` and serve until `shutdown` resolves.
pub async fn run_gateway<F>(host: &str, port: u16, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}"))
        .await
        .with_context(|| format!("binding gateway to {host}:{port}"))?;
    let addr = listener.local_addr()?;

    tracing::info!("Gateway listening on http://{addr}");
    tracing::info!("  GET  /api/status | POST /api/start | POST /api/stop | POST /api/toggle-ai");
    tracing::info!("  GET  /api/events (SSE) | GET /health");
    if let Some(dir) = state.web_dir.as_deref() {
        tracing::info!("  Dashboard files from {}", dir.display());
    }
    health::mark_component_ok(HEALTH_COMPONENT);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server error")
}

// ── Response helpers ─────────────────────────────────────────────

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok_json(value: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

fn failure_json(message: &str, error: &str) -> ApiResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": message, "error": error, "status": "ERROR" })),
    )
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_banner() -> &'static str {
    "Chat relay API server is running! Use /api/status, /api/start, /api/stop, /api/toggle-ai."
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "runtime": health::snapshot_json(),
        "completions": state.pipeline.limiter_stats(),
    }))
}

async fn handle_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.status_payload();
    Json(json!({
        "status": status.status,
        "qr": status.qr,
        "sessionId": status.session_id,
        "aiEnabled": state.pipeline.ai_enabled(),
    }))
}

async fn handle_start(State(state): State<AppState>) -> ApiResponse {
    let was_active = state.supervisor.current_state().0.is_active();
    match state.supervisor.start().await {
        Ok(_) => {
            let status = state.status_payload();
            let message = if was_active {
                "Connection already active or starting."
            } else {
                "Connection started."
            };
            ok_json(json!({
                "status": status.status,
                "qr": status.qr,
                "sessionId": status.session_id,
                "message": message,
            }))
        }
        Err(e) => failure_json("Failed to start connection.", &e.to_string()),
    }
}

async fn handle_stop(State(state): State<AppState>) -> ApiResponse {
    let was_running = state.supervisor.snapshot().has_handle;
    match state.supervisor.stop().await {
        Ok(()) if was_running => ok_json(json!({ "message": "Connection stopped successfully." })),
        Ok(()) => ok_json(json!({ "message": "Connection is not currently running." })),
        Err(e) => failure_json("Failed to stop connection.", &e.to_string()),
    }
}

async fn handle_toggle_ai(State(state): State<AppState>) -> ApiResponse {
    let enabled = state.pipeline.toggle_ai();
    ok_json(json!({
        "success": true,
        "aiEnabled": enabled,
        "message": format!(
            "AI responses are now {}",
            if enabled { "enabled" } else { "disabled" }
        ),
    }))
}
