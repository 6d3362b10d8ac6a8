// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::RateLimitStore;

/// In-memory `RateLimitStore` for unit tests that don't need live Redis.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    service_blocked: Mutex<bool>,
    user_blocks: Mutex<HashMap<i64, DateTime<Utc>>>,
    remaining: Mutex<HashMap<i64, i64>>,
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn mark_service_blocked(&self) {
        *self.service_blocked.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    async fn clear_service_blocked(&self) {
        *self.service_blocked.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    async fn is_service_blocked(&self) -> bool {
        *self.service_blocked.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn mark_user_blocked(&self, user_id: i64, until: DateTime<Utc>) {
        let mut guard = self.user_blocks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard.entry(user_id).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    async fn user_block_end(&self, user_id: i64) -> Option<DateTime<Utc>> {
        self.user_blocks.lock().unwrap_or_else(|e| e.into_inner()).get(&user_id).copied()
    }

    async fn record_limits(&self, user_id: i64, remaining: i64, _limit: i64, _reset_seconds: i64) {
        self.remaining.lock().unwrap_or_else(|e| e.into_inner()).insert(user_id, remaining);
    }

    async fn last_remaining(&self, user_id: i64) -> Option<i64> {
        self.remaining.lock().unwrap_or_else(|e| e.into_inner()).get(&user_id).copied()
    }
}

#[tokio::test]
async fn user_block_never_shortens() {
    let store = InMemoryRateLimitStore::default();
    let short = Utc::now() + chrono::Duration::seconds(30);
    let long = Utc::now() + chrono::Duration::seconds(300);

    store.mark_user_blocked(1, long).await;
    store.mark_user_blocked(1, short).await;

    assert_eq!(store.user_block_end(1).await, Some(long));
}

#[tokio::test]
async fn service_block_clears_on_demand() {
    let store = InMemoryRateLimitStore::default();
    store.mark_service_blocked().await;
    assert!(store.is_service_blocked().await);
    store.clear_service_blocked().await;
    assert!(!store.is_service_blocked().await);
}

#[tokio::test]
async fn unblocked_user_has_no_block_end() {
    let store = InMemoryRateLimitStore::default();
    assert_eq!(store.user_block_end(42).await, None);
}
