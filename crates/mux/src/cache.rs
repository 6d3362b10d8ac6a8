// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C4 - Patrol-Score Cache: two-tier freshness model for device-visible
//! patrol scores. See spec §4.4.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::gateway::Principal;
use crate::kv::Kv;
use crate::ratelimit::RateLimitStore;
use crate::reader::Reader;
use crate::types::{CachedPatrolScores, RateLimitState};

/// Outcome of a [`PatrolScoreCache::read`] call, mirroring the shape of the
/// downstream `GET /api/v1/patrols` response named in spec §6.
pub struct ReadResult {
    pub envelope: CachedPatrolScores,
    pub from_cache: bool,
}

pub struct PatrolScoreCache {
    kv: Kv,
    rate_limit: Arc<dyn RateLimitStore>,
    reader: Arc<Reader>,
    storage_ttl_secs: u64,
    caution: i64,
    warning: i64,
    critical: i64,
}

impl PatrolScoreCache {
    pub fn new(
        kv: Kv,
        rate_limit: Arc<dyn RateLimitStore>,
        reader: Arc<Reader>,
        config: &AppConfig,
    ) -> Self {
        Self {
            kv,
            rate_limit,
            reader,
            storage_ttl_secs: config.cache_fallback_ttl().as_secs(),
            caution: config.rate_limit_caution,
            warning: config.rate_limit_warning,
            critical: config.rate_limit_critical,
        }
    }

    fn key(device_code: &str) -> String {
        format!("patrol_scores:{device_code}")
    }

    async fn load(&self, device_code: &str) -> Option<CachedPatrolScores> {
        let raw = self.kv.get(&Self::key(device_code)).await.ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    async fn store(&self, device_code: &str, envelope: &CachedPatrolScores) {
        if let Ok(serialized) = serde_json::to_string(envelope) {
            if let Err(e) = self.kv.set_ex(&Self::key(device_code), &serialized, self.storage_ttl_secs).await
            {
                tracing::warn!(err = %e, device_code, "patrol-score cache write failed");
            }
        }
    }

    /// Logical freshness TTL as a function of last-observed rate-limit
    /// remaining, per the table in spec §4.4.
    fn logical_ttl(&self, remaining: Option<i64>) -> chrono::Duration {
        let minutes = match remaining {
            Some(r) if r >= self.caution => 5,
            Some(r) if r >= self.warning => 10,
            Some(r) if r >= self.critical => 15,
            _ => 30,
        };
        chrono::Duration::minutes(minutes)
    }

    fn freshness_state(&self, remaining: Option<i64>) -> RateLimitState {
        match remaining {
            Some(r) if r < self.warning => RateLimitState::Degraded,
            _ => RateLimitState::None,
        }
    }

    /// Read algorithm per spec §4.4.
    pub async fn read(
        &self,
        device_code: &str,
        principal: &Principal,
        section_id: i64,
        term_id: i64,
    ) -> Result<ReadResult, AppError> {
        let cached = self.load(device_code).await;

        // Step 1: global block.
        if self.rate_limit.is_service_blocked().await {
            return match cached {
                Some(mut envelope) => {
                    envelope.rate_limit_state = RateLimitState::Blocked;
                    Ok(ReadResult { envelope, from_cache: true })
                }
                None => Err(AppError::ServiceBlocked),
            };
        }

        // Step 2: per-user block with a cached fallback.
        if let Some(blocked_until) = self.rate_limit.user_block_end(principal.user_id).await {
            if blocked_until > Utc::now() {
                if let Some(mut envelope) = cached.clone() {
                    envelope.rate_limit_state = RateLimitState::Blocked;
                    return Ok(ReadResult { envelope, from_cache: true });
                }
                return Err(AppError::UserBlocked { blocked_until });
            }
        }

        // Step 3: fresh-enough cache hit.
        if let Some(envelope) = cached.clone() {
            if envelope.valid_until > Utc::now() {
                return Ok(ReadResult { envelope, from_cache: true });
            }
        }

        // Step 4: refresh via C3.
        match self.reader.fetch_patrol_scores(principal, section_id, term_id).await {
            Ok((patrols, rate_limit_info)) => {
                let remaining = rate_limit_info.map(|i| i.remaining);
                let valid_until = Utc::now() + self.logical_ttl(remaining);
                let envelope = CachedPatrolScores {
                    patrols,
                    fetched_at: Utc::now(),
                    valid_until,
                    rate_limit_state: self.freshness_state(remaining),
                };
                self.store(device_code, &envelope).await;
                Ok(ReadResult { envelope, from_cache: false })
            }
            Err(AppError::UserBlocked { blocked_until }) => {
                if let Some(mut envelope) = cached {
                    envelope.rate_limit_state = RateLimitState::Blocked;
                    Ok(ReadResult { envelope, from_cache: true })
                } else {
                    Err(AppError::UserBlocked { blocked_until })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Used by the device-read path's 429-equivalent fallback to compute a
    /// `Retry-After` header value when there is no cache to fall back on.
    pub fn retry_after_secs(blocked_until: DateTime<Utc>) -> i64 {
        (blocked_until - Utc::now()).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_ttl_matches_table() {
        let config = test_config();
        let cache = test_cache(&config);
        assert_eq!(cache.logical_ttl(Some(250)), chrono::Duration::minutes(5));
        assert_eq!(cache.logical_ttl(Some(150)), chrono::Duration::minutes(10));
        assert_eq!(cache.logical_ttl(Some(50)), chrono::Duration::minutes(15));
        assert_eq!(cache.logical_ttl(Some(5)), chrono::Duration::minutes(30));
        assert_eq!(cache.logical_ttl(None), chrono::Duration::minutes(30));
    }

    #[test]
    fn freshness_state_degrades_below_warning() {
        let config = test_config();
        let cache = test_cache(&config);
        assert_eq!(cache.freshness_state(Some(150)), RateLimitState::None);
        assert_eq!(cache.freshness_state(Some(50)), RateLimitState::Degraded);
    }

    fn test_config() -> AppConfig {
        AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: String::new(),
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

    fn test_cache(config: &AppConfig) -> PatrolScoreCache {
        let kv = Kv::connect(&config.redis_url).expect("build lazy redis pool");
        let rate_limit: Arc<dyn RateLimitStore> =
            Arc::new(crate::ratelimit::tests::InMemoryRateLimitStore::default());
        let gateway = Arc::new(
            crate::gateway::OsmGateway::new(config.osm_base_url.clone(), Arc::clone(&rate_limit))
                .expect("build gateway"),
        );
        let reader = Arc::new(Reader::new(gateway, kv.clone()));
        PatrolScoreCache::new(kv, rate_limit, reader, config)
    }
}
