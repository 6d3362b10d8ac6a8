// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application state wiring C1-C10 together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::cache::PatrolScoreCache;
use crate::config::AppConfig;
use crate::credential::CredentialManager;
use crate::device_auth::DeviceAuthContext;
use crate::gateway::OsmGateway;
use crate::hub::Hub;
use crate::kv::Kv;
use crate::lock::DistributedLock;
use crate::outbox::OutboxStore;
use crate::ratelimit::{RateLimitStore, RedisRateLimitStore};
use crate::reader::Reader;

pub struct AppState {
    pub config: AppConfig,
    pub gateway: Arc<OsmGateway>,
    pub reader: Arc<Reader>,
    pub cache: Arc<PatrolScoreCache>,
    pub outbox: Arc<OutboxStore>,
    pub lock: Arc<DistributedLock>,
    pub credentials: Arc<CredentialManager>,
    pub device_auth: Arc<DeviceAuthContext>,
    pub audit: Arc<AuditLog>,
    pub hub: Arc<Hub>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let shutdown = CancellationToken::new();

        let kv = Kv::connect(&config.redis_url)?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        let rate_limit: Arc<dyn RateLimitStore> = Arc::new(RedisRateLimitStore::new(kv.clone()));
        let gateway = Arc::new(OsmGateway::new(config.osm_base_url.clone(), Arc::clone(&rate_limit))?);
        let reader = Arc::new(Reader::new(Arc::clone(&gateway), kv.clone()));
        let cache = Arc::new(PatrolScoreCache::new(kv.clone(), Arc::clone(&rate_limit), Arc::clone(&reader), &config));

        let outbox = Arc::new(OutboxStore::new(pool.clone()));
        let lock = Arc::new(DistributedLock::new(kv.clone()));
        let audit = Arc::new(AuditLog::new(pool.clone()));
        let hub = Arc::new(Hub::new(kv.clone(), config.redis_url.clone(), shutdown.clone()));

        let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build()?;
        let credentials = Arc::new(CredentialManager::new(
            pool.clone(),
            http.clone(),
            &config.osm_base_url,
            config.osm_client_id.clone(),
        ));
        let device_auth = Arc::new(DeviceAuthContext::new(
            pool,
            http,
            &config.osm_base_url,
            config.osm_client_id.clone(),
        ));

        Ok(Arc::new(Self {
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
        }))
    }
}
