// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plain HTTP read endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use waldo_core::command::Command;
use waldo_core::system::System;

/// `GET /api/v1/health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// `GET /api/v1/status`
pub async fn status(State(system): State<Arc<System>>) -> Json<serde_json::Value> {
    match system.handle_command(Command::GetSystemStatus).await {
        Ok(data) => Json(data),
        Err(e) => Json(serde_json::json!({ "error": e.to_error_body() })),
    }
}

/// `GET /api/v1/telemetry`
pub async fn telemetry(State(system): State<Arc<System>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "telemetry": system.telemetry().snapshot() }))
}

/// `GET /api/v1/scenes`
pub async fn scenes(State(system): State<Arc<System>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "scenes": system.config().scenes().scenes }))
}
