// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the operability surfaces this crate terminates
//! itself: `/healthz` and `/metrics`. The WS upgrade route requires a live
//! Postgres-backed device lookup and is covered by unit tests on
//! `device_auth::DeviceAuthContext` instead.

use std::sync::Arc;

use axum_test::TestServer;
use tokio_util::sync::CancellationToken;

use osmbridge::audit::AuditLog;
use osmbridge::cache::PatrolScoreCache;
use osmbridge::config::AppConfig;
use osmbridge::credential::CredentialManager;
use osmbridge::device_auth::DeviceAuthContext;
use osmbridge::gateway::OsmGateway;
use osmbridge::hub::Hub;
use osmbridge::kv::Kv;
use osmbridge::lock::DistributedLock;
use osmbridge::outbox::OutboxStore;
use osmbridge::ratelimit::{RateLimitStore, RedisRateLimitStore};
use osmbridge::reader::Reader;
use osmbridge::state::AppState;
use osmbridge::transport::build_router;

fn test_config() -> AppConfig {
    AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        database_url: "postgres://unused.invalid/osmbridge".into(),
        redis_url: "redis://127.0.0.1:6379".into(),
        osm_base_url: "http://unused.invalid".into(),
        osm_client_id: "client".into(),
        public_domain: None,
        cache_fallback_ttl_hours: 192,
        rate_limit_caution: 200,
        rate_limit_warning: 100,
        rate_limit_critical: 20,
        outbox_poll_interval_secs: 30,
        outbox_workers: 1,
        lock_ttl_secs: 60,
        credential_retention_days: 7,
        audit_retention_days: 14,
        device_retention_days: 30,
    }
}

/// Builds a fully-wired `AppState` without touching a live Postgres or
/// Redis instance: both pools connect lazily, and these tests only exercise
/// routes (`/healthz`, `/metrics`) that never issue a query.
fn test_state() -> Arc<AppState> {
    let config = test_config();
    let shutdown = CancellationToken::new();

    let kv = Kv::connect(&config.redis_url).expect("build lazy redis pool");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .expect("build lazy postgres pool");

    let rate_limit: Arc<dyn RateLimitStore> = Arc::new(RedisRateLimitStore::new(kv.clone()));
    let gateway =
        Arc::new(OsmGateway::new(config.osm_base_url.clone(), Arc::clone(&rate_limit)).expect("build gateway"));
    let reader = Arc::new(Reader::new(Arc::clone(&gateway), kv.clone()));
    let cache = Arc::new(PatrolScoreCache::new(kv.clone(), Arc::clone(&rate_limit), Arc::clone(&reader), &config));

    let outbox = Arc::new(OutboxStore::new(pool.clone()));
    let lock = Arc::new(DistributedLock::new(kv.clone()));
    let audit = Arc::new(AuditLog::new(pool.clone()));
    let hub = Arc::new(Hub::new(kv, config.redis_url.clone(), shutdown.clone()));

    let http = reqwest::Client::builder().build().expect("build http client");
    let credentials = Arc::new(CredentialManager::new(
        pool.clone(),
        http.clone(),
        &config.osm_base_url,
        config.osm_client_id.clone(),
    ));
    let device_auth =
        Arc::new(DeviceAuthContext::new(pool, http, &config.osm_base_url, config.osm_client_id.clone()));

    Arc::new(AppState {
        config,
        gateway,
        reader,
        cache,
        outbox,
        lock,
        credentials,
        device_auth,
        audit,
        hub,
        shutdown,
    })
}

#[tokio::test]
async fn healthz_returns_ok_before_shutdown() {
    let state = test_state();
    let server = TestServer::new(build_router(state)).expect("create test server");

    let resp = server.get("/healthz").await;
    resp.assert_status_ok();
    assert_eq!(resp.text(), "ok");
}

#[tokio::test]
async fn healthz_reports_shutting_down_after_cancellation() {
    let state = test_state();
    state.shutdown.cancel();
    let server = TestServer::new(build_router(state)).expect("create test server");

    let resp = server.get("/healthz").await;
    resp.assert_status_ok();
    assert_eq!(resp.text(), "shutting down");
}

#[tokio::test]
async fn metrics_starts_empty_and_reports_gateway_requests() {
    let state = test_state();
    state.gateway.latency.record("getTerms", 200, std::time::Duration::from_millis(42));
    let server = TestServer::new(build_router(state)).expect("create test server");

    let resp = server.get("/metrics").await;
    resp.assert_status_ok();
    let body = resp.text();
    assert!(body.contains("osm_gateway_requests_total"));
    assert!(body.contains("endpoint=\"getTerms\""));
    assert!(body.contains("status=\"200\""));
}

#[tokio::test]
async fn ws_device_upgrade_rejects_missing_token() {
    let state = test_state();
    let server = TestServer::new(build_router(state)).expect("create test server");

    let resp = server.get("/ws/device").await;
    assert!(resp.status_code().is_client_error());
}
