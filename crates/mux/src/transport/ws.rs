// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Downstream WebSocket handler for scoreboard devices (C9 / C10). See
//! spec §4.9 for lifecycle and timing, §4.10 for auth.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::device_auth::{www_authenticate_header, RETRY_AFTER_SECS};
use crate::error::AppError;
use crate::hub::{self, Hub};
use crate::state::AppState;
use crate::types::ADHOC_SECTION_ID;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_MESSAGE_BYTES: usize = 512;

#[derive(Debug, Deserialize)]
pub struct DeviceWsQuery {
    pub token: String,
}

/// `GET /ws/device?token=...` - WebSocket upgrade for a scoreboard device.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !origin_allowed(&headers, state.config.public_domain.as_deref()) {
        return axum::http::Response::builder()
            .status(403)
            .body(axum::body::Body::from("origin not allowed"))
            .unwrap_or_default()
            .into_response();
    }

    let device = match state.device_auth.authenticate_token(&query.token).await {
        Ok(device) => device,
        Err(e) => return auth_error_response(&e).into_response(),
    };

    let device_code = device.device().device_code.clone();
    let routing_key = match device.device().section_id {
        Some(section_id) if section_id != ADHOC_SECTION_ID => Hub::section_key(section_id),
        _ => match device.user_id() {
            Some(uid) => Hub::adhoc_key(uid),
            None => {
                return (axum::http::StatusCode::CONFLICT, "device has no associated user").into_response()
            }
        },
    };

    let registration = match state.hub.register(device_code.clone(), routing_key).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(err = %e, "hub registration failed, rejecting WS upgrade");
            return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "registration failed").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_ws(socket, state, device_code, registration))
        .into_response()
}

/// Maps a C10 authentication failure to its HTTP response per spec §4.10:
/// 401 carries `WWW-Authenticate`, 503 carries `Retry-After: 60`.
fn auth_error_response(e: &AppError) -> axum::http::Response<axum::body::Body> {
    let status = axum::http::StatusCode::from_u16(e.http_status())
        .unwrap_or(axum::http::StatusCode::UNAUTHORIZED);
    let mut builder = axum::http::Response::builder().status(status);
    match status {
        axum::http::StatusCode::UNAUTHORIZED => {
            builder = builder.header(axum::http::header::WWW_AUTHENTICATE, www_authenticate_header());
        }
        axum::http::StatusCode::SERVICE_UNAVAILABLE => {
            builder = builder.header(axum::http::header::RETRY_AFTER, RETRY_AFTER_SECS.to_string());
        }
        _ => {}
    }
    builder.body(axum::body::Body::from(e.to_string())).unwrap_or_default()
}

fn origin_allowed(headers: &HeaderMap, public_domain: Option<&str>) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true; // native clients send no Origin.
    };
    let Some(domain) = public_domain else { return true };
    origin.trim_end_matches('/') == domain.trim_end_matches('/')
}

async fn handle_ws(
    socket: WebSocket,
    state: Arc<AppState>,
    device_code: String,
    mut registration: hub::Registration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let conn_id = registration.conn_id;

    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    let mut last_pong = Instant::now();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            _ = ping_tick.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(device_code = %redacted(&device_code), "pong timeout, closing");
                    break;
                }
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    let _ = send_text_with_deadline(&mut ws_tx, hub::disconnect_payload("idle timeout")).await;
                    break;
                }
                if send_ping_with_deadline(&mut ws_tx).await.is_err() {
                    break;
                }
            }

            // Hub -> device.
            msg = registration.inbox.recv() => {
                match msg {
                    Some(payload) => {
                        if send_text_with_deadline(&mut ws_tx, payload).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Device -> hub (inbound status pings are logged only).
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        log_status(&device_code, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(device_code = %redacted(&device_code), err = %e, "WS read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.device_auth.update_last_used(&device_code).await;
    state.hub.unregister(&device_code, conn_id).await;
}

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

async fn send_text_with_deadline(ws_tx: &mut WsSink, payload: String) -> Result<(), ()> {
    tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(payload.into())))
        .await
        .map_err(|_| ())
        .and_then(|r| r.map_err(|_| ()))
}

async fn send_ping_with_deadline(ws_tx: &mut WsSink) -> Result<(), ()> {
    tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Ping(Vec::new().into())))
        .await
        .map_err(|_| ())
        .and_then(|r| r.map_err(|_| ()))
}

fn log_status(device_code: &str, text: &str) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if value.get("type").and_then(|t| t.as_str()) == Some("status") {
            let uptime = value.get("uptime").cloned().unwrap_or(serde_json::Value::Null);
            tracing::info!(device_code = %redacted(device_code), ?uptime, "device status");
        }
    }
}

fn redacted(device_code: &str) -> String {
    device_code.chars().take(8).collect()
}
