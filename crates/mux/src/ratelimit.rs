// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C1 - RateLimitStore: per-user temporary blocks and the global
//! service-blocked kill switch, backed by a shared key-value store with
//! TTLs. See spec §4.1.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::kv::Kv;

const SERVICE_BLOCKED_KEY: &str = "osm_service_blocked";

fn user_blocked_key(user_id: i64) -> String {
    format!("osm_blocked:{user_id}")
}

fn ratelimit_key(user_id: i64) -> String {
    format!("osm_ratelimit:{user_id}")
}

/// Capability set for rate-limit state, per spec §9 ("Dynamic dispatch").
/// Concrete implementations never fail the caller outright on a backing-store
/// error; they fail open (not blocked) and log at WARN, per the contract in
/// spec §4.1.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn mark_service_blocked(&self);
    async fn is_service_blocked(&self) -> bool;
    /// Never shortens an existing block; only extends it.
    async fn mark_user_blocked(&self, user_id: i64, until: DateTime<Utc>);
    async fn user_block_end(&self, user_id: i64) -> Option<DateTime<Utc>>;
    async fn record_limits(&self, user_id: i64, remaining: i64, limit: i64, reset_seconds: i64);
    async fn last_remaining(&self, user_id: i64) -> Option<i64>;
    /// Clears the global kill switch. Called on the first successful OSM
    /// response after a block (spec scenario 3).
    async fn clear_service_blocked(&self);
}

/// Redis-backed production implementation.
pub struct RedisRateLimitStore {
    kv: Kv,
}

impl RedisRateLimitStore {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn mark_service_blocked(&self) {
        // No TTL: requires operator action (or a successful 200) to clear.
        if let Err(e) = self.kv.set_ex(SERVICE_BLOCKED_KEY, "1", u64::MAX / 2).await {
            tracing::warn!(err = %e, "failed to persist global service-blocked flag");
        }
    }

    async fn clear_service_blocked(&self) {
        if let Err(e) = self.kv.del(SERVICE_BLOCKED_KEY).await {
            tracing::warn!(err = %e, "failed to clear global service-blocked flag");
        }
    }

    async fn is_service_blocked(&self) -> bool {
        match self.kv.get(SERVICE_BLOCKED_KEY).await {
            Ok(v) => v.is_some(),
            Err(e) => {
                tracing::warn!(err = %e, "rate-limit store lookup failed, failing open");
                false
            }
        }
    }

    async fn mark_user_blocked(&self, user_id: i64, until: DateTime<Utc>) {
        let key = user_blocked_key(user_id);
        // Never shorten an existing block.
        if let Some(existing) = self.user_block_end(user_id).await {
            if existing >= until {
                return;
            }
        }
        let ttl = (until - Utc::now()).num_seconds().max(1) as u64;
        if let Err(e) = self.kv.set_ex(&key, &until.to_rfc3339(), ttl).await {
            tracing::warn!(err = %e, user_id, "failed to persist user block");
        }
    }

    async fn user_block_end(&self, user_id: i64) -> Option<DateTime<Utc>> {
        match self.kv.get(&user_blocked_key(user_id)).await {
            Ok(Some(v)) => DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(err = %e, user_id, "rate-limit store lookup failed, failing open");
                None
            }
        }
    }

    async fn record_limits(&self, user_id: i64, remaining: i64, limit: i64, reset_seconds: i64) {
        let value = format!("{remaining}:{limit}:{reset_seconds}");
        // TTL generously bounds staleness of the observed-limits record; it
        // is advisory (drives cache-TTL adaptation), not authoritative.
        if let Err(e) = self.kv.set_ex(&ratelimit_key(user_id), &value, 3600).await {
            tracing::warn!(err = %e, user_id, "failed to record observed rate limits");
        }
    }

    async fn last_remaining(&self, user_id: i64) -> Option<i64> {
        let v = self.kv.get(&ratelimit_key(user_id)).await.ok().flatten()?;
        v.split(':').next()?.parse().ok()
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
pub(crate) mod tests;
