// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the control server.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use waldo_core::system::System;

/// Build the axum `Router` with all control routes.
pub fn build_router(system: Arc<System>) -> Router {
    Router::new()
        // Health (no side effects)
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/status", get(http::status))
        // One-shot reads for clients that do not hold a socket open
        .route("/api/v1/telemetry", get(http::telemetry))
        .route("/api/v1/scenes", get(http::scenes))
        // Command + broadcast channel
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(system)
}
