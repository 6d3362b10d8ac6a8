// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the osmbridge service.
//!
//! The downstream device and admin REST APIs are named-only collaborators
//! (spec §1); this crate terminates only the surfaces the hard core itself
//! owns: the WebSocket upgrade for C9 and a `/healthz` / `/metrics` pair for
//! operability, grounded on the teacher's `GET /api/v1/health`.

pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Builds the axum `Router` with every route this crate terminates.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/ws/device", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> &'static str {
    if state.shutdown.is_cancelled() {
        "shutting down"
    } else {
        "ok"
    }
}

async fn metrics(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> String {
    state.gateway.latency.render_prometheus()
}
