// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the osmbridge service.
#[derive(Debug, Clone, clap::Args)]
pub struct AppConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "OSMBRIDGE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "OSMBRIDGE_PORT")]
    pub port: u16,

    /// Postgres connection string for the outbox/credential/audit stores.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Redis connection string for rate-limit state, caches, locks, and pub/sub.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    /// Base URL of the upstream OSM API.
    #[arg(long, default_value = "https://www.onlinescoutmanager.co.uk", env = "OSM_BASE_URL")]
    pub osm_base_url: String,

    /// OSM OAuth client id, used for token refresh.
    #[arg(long, env = "OSM_CLIENT_ID")]
    pub osm_client_id: String,

    /// Public origin devices/browsers connect through (for WS Origin checks).
    #[arg(long, env = "OSMBRIDGE_PUBLIC_DOMAIN")]
    pub public_domain: Option<String>,

    /// Storage TTL for the patrol-score cache envelope, in hours.
    #[arg(long, default_value_t = 192, env = "CACHE_FALLBACK_TTL")]
    pub cache_fallback_ttl_hours: u64,

    /// Remaining-requests threshold above which cache logical TTL is 5 min.
    #[arg(long, default_value_t = 200, env = "RATE_LIMIT_CAUTION")]
    pub rate_limit_caution: i64,

    /// Remaining-requests threshold above which cache logical TTL is 10 min.
    #[arg(long, default_value_t = 100, env = "RATE_LIMIT_WARNING")]
    pub rate_limit_warning: i64,

    /// Remaining-requests threshold above which cache logical TTL is 15 min
    /// (below it, 30 min).
    #[arg(long, default_value_t = 20, env = "RATE_LIMIT_CRITICAL")]
    pub rate_limit_critical: i64,

    /// Sync worker tick interval, in seconds.
    #[arg(long, default_value_t = 30, env = "OUTBOX_POLL_INTERVAL")]
    pub outbox_poll_interval_secs: u64,

    /// Number of concurrent sync worker loops. Documented default is 1.
    #[arg(long, default_value_t = 1, env = "OUTBOX_WORKERS")]
    pub outbox_workers: u32,

    /// Distributed lock TTL, in seconds.
    #[arg(long, default_value_t = 60, env = "LOCK_TTL")]
    pub lock_ttl_secs: u64,

    /// Credential idle retention, in days, before garbage collection.
    #[arg(long, default_value_t = 7, env = "CREDENTIAL_RETENTION_DAYS")]
    pub credential_retention_days: i64,

    /// Audit log retention, in days.
    #[arg(long, default_value_t = 14, env = "AUDIT_RETENTION_DAYS")]
    pub audit_retention_days: i64,

    /// Unused device-code retention, in days.
    #[arg(long, default_value_t = 30, env = "DEVICE_RETENTION_DAYS")]
    pub device_retention_days: i64,
}

impl AppConfig {
    pub fn cache_fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_fallback_ttl_hours * 3600)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_poll_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn credential_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.credential_retention_days)
    }

    pub fn audit_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.audit_retention_days)
    }

    pub fn device_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.device_retention_days)
    }
}
