// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C7 - Distributed Lock: TTL'd mutual exclusion for outbox work over a
//! `(user, section, patrol)` tuple. See spec §4.7.

use redis::Script;
use uuid::Uuid;

use crate::error::AppError;
use crate::kv::Kv;

/// Atomic check-and-delete: only removes the key if its value still matches
/// the caller's owner token, so a lock cannot be released by a holder whose
/// TTL has already expired and been reacquired by someone else.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Atomic check-and-extend: only refreshes the TTL if the owner still holds
/// the lock.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

fn lock_key(osm_user_id: i64, section_id: i64, patrol_id: &str) -> String {
    format!("outbox:lock:{osm_user_id}:{section_id}:{patrol_id}")
}

/// A held lock; carries the owner token needed to release or extend it.
pub struct LockGuard {
    key: String,
    owner: String,
}

pub struct DistributedLock {
    kv: Kv,
}

impl DistributedLock {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Attempts to acquire the lock for `(user, section, patrol)` with the
    /// given TTL. The owner value is a monotonic timestamp plus a random
    /// component so a crash-and-restart of this process never collides with
    /// a lock it previously held.
    pub async fn try_acquire(
        &self,
        osm_user_id: i64,
        section_id: i64,
        patrol_id: &str,
        ttl: std::time::Duration,
    ) -> Result<Option<LockGuard>, AppError> {
        let key = lock_key(osm_user_id, section_id, patrol_id);
        let owner = format!("{}:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0), Uuid::new_v4());
        let acquired = self.kv.set_if_absent_ex(&key, &owner, ttl.as_secs()).await?;
        if acquired {
            Ok(Some(LockGuard { key, owner }))
        } else {
            Ok(None)
        }
    }

    /// Deletes the lock only if `guard` is still the current owner. A
    /// failure here is logged but non-fatal; the TTL will eventually reap
    /// the key.
    pub async fn release(&self, guard: &LockGuard) {
        let script = Script::new(RELEASE_SCRIPT);
        let result: Result<i64, AppError> =
            self.kv.eval(&script, &[guard.key.as_str()], &[guard.owner.as_str()]).await;
        match result {
            Ok(1) => {}
            Ok(_) => tracing::warn!(key = %guard.key, "lock release found a different owner, skipping"),
            Err(e) => tracing::warn!(err = %e, key = %guard.key, "lock release failed, relying on TTL reap"),
        }
    }

    /// Refreshes the TTL only if `guard` is still the current owner.
    pub async fn extend(
        &self,
        guard: &LockGuard,
        ttl: std::time::Duration,
    ) -> Result<bool, AppError> {
        let script = Script::new(EXTEND_SCRIPT);
        let ttl_arg = ttl.as_secs().to_string();
        let result: i64 = self
            .kv
            .eval(&script, &[guard.key.as_str()], &[guard.owner.as_str(), ttl_arg.as_str()])
            .await?;
        Ok(result == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_format_matches_spec() {
        assert_eq!(lock_key(1, 2, "p3"), "outbox:lock:1:2:p3");
    }
}
