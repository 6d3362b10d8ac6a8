// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! osmbridge: OAuth custody and score synchronization bridging scoreboard
//! devices, an admin UI, and the Online Scout Manager REST API.

pub mod audit;
pub mod cache;
pub mod config;
pub mod credential;
pub mod device_auth;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod kv;
pub mod lock;
pub mod outbox;
pub mod ratelimit;
pub mod reader;
pub mod state;
pub mod transport;
pub mod types;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::AppConfig;
use crate::state::AppState;
use crate::transport::build_router;
use crate::worker::SyncWorker;

/// Runs the osmbridge service until shutdown.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let poll_interval = config.outbox_poll_interval();
    let workers = config.outbox_workers.max(1);
    let credential_retention = config.credential_retention();
    let audit_retention = config.audit_retention();
    let device_retention = config.device_retention();

    let state = AppState::new(config).await?;

    for n in 0..workers {
        let worker = SyncWorker::new(
            Arc::clone(&state.outbox),
            Arc::clone(&state.lock),
            Arc::clone(&state.credentials),
            Arc::clone(&state.reader),
            Arc::clone(&state.audit),
            Arc::clone(&state.hub),
            poll_interval,
        );
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            tracing::info!(worker = n, "sync worker starting");
            worker.run(shutdown).await;
        });
    }

    spawn_gc_loop(Arc::clone(&state), credential_retention, audit_retention, device_retention);

    tracing::info!("osmbridge listening on {addr}");
    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(state.shutdown.clone().cancelled_owned())
        .await?;

    Ok(())
}

/// Periodic garbage collection: idle credentials (C6), stale device codes
/// (C10), and audit/outbox retention windows (spec §4.5/§4.6). Runs on a
/// generous fixed interval since these windows are measured in days.
fn spawn_gc_loop(
    state: Arc<AppState>,
    credential_retention: chrono::Duration,
    audit_retention: chrono::Duration,
    device_retention: chrono::Duration,
) {
    const GC_INTERVAL: Duration = Duration::from_secs(3600);

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(GC_INTERVAL);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }

            match state.credentials.purge_idle(credential_retention).await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "credential GC removed idle rows"),
                Ok(_) => {}
                Err(e) => tracing::warn!(err = %e, "credential GC failed"),
            }

            match state.device_auth.purge_unused(device_retention).await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "device-code GC removed unused rows"),
                Ok(_) => {}
                Err(e) => tracing::warn!(err = %e, "device-code GC failed"),
            }

            match state.audit.purge_older_than(audit_retention).await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "audit log GC removed old rows"),
                Ok(_) => {}
                Err(e) => tracing::warn!(err = %e, "audit log GC failed"),
            }

            let completed_cutoff = chrono::Utc::now() - chrono::Duration::days(7);
            match state.outbox.purge_completed(completed_cutoff).await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "outbox GC removed completed rows"),
                Ok(_) => {}
                Err(e) => tracing::warn!(err = %e, "outbox completed-row GC failed"),
            }

            let failed_cutoff = chrono::Utc::now() - chrono::Duration::days(30);
            match state.outbox.purge_failed(failed_cutoff).await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "outbox GC removed abandoned rows"),
                Ok(_) => {}
                Err(e) => tracing::warn!(err = %e, "outbox abandoned-row GC failed"),
            }
        }
    });
}
