// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP surface.
//!
//! Endpoints:
//!   GET    /ws                                     → WebSocket, streaming session
//!   GET    /api/cameras                            → configured camera list
//!   GET    /api/history/sessions?camera_id&limit   → recent session rows
//!   GET    /api/history/sessions/{id}/ticks?limit  → tick time-series
//!   DELETE /api/history/sessions/{id}              → delete session + ticks
//!   GET    /<record_root_name>/...                 → recorded media (static)

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::Config;
use crate::db::Db;
use crate::model::SharedModels;
use crate::session;

/// Shared state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub models: SharedModels,
    pub db: Option<Db>,
}

#[derive(Deserialize)]
pub struct SessionListParams {
    camera_id: Option<String>,
    #[serde(default = "default_session_limit")]
    limit: i64,
}

fn default_session_limit() -> i64 { 100 }

#[derive(Deserialize)]
pub struct TickListParams {
    /// 0 = unlimited.
    #[serde(default)]
    limit: i64,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let record_root = state.config.paths.record_root.clone();
    let record_mount = record_root
        .file_name()
        .map(|n| format!("/{}", n.to_string_lossy()))
        .unwrap_or_else(|| "/records".to_string());

    Router::new()
        .route("/ws", get(handle_ws))
        .route("/api/cameras", get(handle_cameras))
        .route("/api/history/sessions", get(handle_list_sessions))
        .route("/api/history/sessions/{session_id}/ticks", get(handle_list_ticks))
        .route("/api/history/sessions/{session_id}", delete(handle_delete_session))
        // Persisted record paths are relative to the root's parent, so
        // mounting the root under its own name serves them unchanged.
        .nest_service(&record_mount, ServeDir::new(record_root))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server; runs until CTRL+C.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received CTRL+C, shutting down…");
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_ws(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run(socket, state))
}

async fn handle_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cameras: Vec<serde_json::Value> = state
        .config
        .cameras
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "name": c.name,
                "location": c.location,
                "url": c.url,
                "source_type": c.source_type,
            })
        })
        .collect();

    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "cameras": cameras, "total": cameras.len() })),
    )
}

async fn handle_list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SessionListParams>,
) -> impl IntoResponse {
    let Some(db) = &state.db else {
        return db_disabled();
    };

    let limit = params.limit.clamp(1, 500);
    match db.list_sessions(params.camera_id.as_deref(), limit).await {
        Ok(items) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "items": items, "total": items.len() })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_list_ticks(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Query(params): Query<TickListParams>,
) -> impl IntoResponse {
    let Some(db) = &state.db else {
        return db_disabled();
    };

    match db.list_ticks(session_id, params.limit).await {
        Ok(items) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "items": items, "count": items.len() })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> impl IntoResponse {
    let Some(db) = &state.db else {
        return db_disabled();
    };

    match db.delete_session(session_id).await {
        Ok(true) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "success": true, "id": session_id })),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": "session not found" })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

fn db_disabled() -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(serde_json::json!({ "error": "database is disabled" })),
    )
        .into_response()
}

fn internal_error(e: crate::error::MonitorError) -> axum::response::Response {
    error!(error = %e, "History query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
