// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain entities shared across components. See `score_update_outbox`'s
//! doc comment in `outbox::store` for the relational shape these map onto.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel section id for a user's "ad-hoc" local-only section.
pub const ADHOC_SECTION_ID: i64 = 0;

pub const MAX_ATTEMPTS: i32 = 10;
pub const MAX_POINTS_DELTA: i64 = 1000;

/// A registered scoreboard device (C10's subject, C6's secondary holder).
#[derive(Debug, Clone)]
pub struct DeviceCode {
    pub device_code: String,
    pub device_access_token: Option<String>,
    pub osm_refresh_token: Option<String>,
    pub osm_access_token: Option<String>,
    pub osm_token_expires_at: Option<DateTime<Utc>>,
    pub section_id: Option<i64>,
    pub osm_user_id: Option<i64>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeviceCode {
    /// First 8 chars only: device codes are secret-bearing and must never be
    /// logged in full.
    pub fn redacted(&self) -> String {
        self.device_code.chars().take(8).collect()
    }
}

/// An admin browser session.
#[derive(Debug, Clone)]
pub struct WebSession {
    pub session_id: String,
    pub osm_user_id: i64,
    pub osm_access_token: String,
    pub osm_refresh_token: String,
    pub osm_token_expires_at: DateTime<Utc>,
    pub csrf_token: String,
    pub section_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One-per-OSM-user long-lived credential holder, used by the sync worker
/// when no interactive session exists.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub osm_user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub stale: bool,
}

/// Outbox row status. Stored as text in Postgres (see `outbox::store`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
    Abandoned,
}

impl OutboxStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "in-flight" => Self::InFlight,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            _ => Self::Pending,
        }
    }
}

/// A single pending or processed score delta. See spec §3 for invariants.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub idempotency_key: String,
    pub osm_user_id: i64,
    pub section_id: i64,
    pub patrol_id: String,
    pub points_delta: i64,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A routing coordinate produced by `list_work`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkTuple {
    pub osm_user_id: i64,
    pub section_id: i64,
    pub patrol_id: String,
}

/// OSM profile, as returned by `GET /oauth/resource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: i64,
    pub full_name: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub section_id: i64,
    pub section_name: String,
    pub group_name: String,
    pub terms: Vec<Term>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub term_id: i64,
    pub name: String,
    pub startdate: String,
    pub enddate: String,
}

/// `{id, name, score}` domain record for a patrol, after filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatrolScore {
    pub id: String,
    pub name: String,
    pub score: i64,
}

/// Coarse freshness state surfaced to device reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLimitState {
    None,
    Degraded,
    Blocked,
}

/// Observed OSM rate-limit headers for one request.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// Cached patrol-score envelope (C4's value type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPatrolScores {
    pub patrols: Vec<PatrolScore>,
    pub fetched_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub rate_limit_state: RateLimitState,
}

/// Append-only audit record for one applied OSM write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreAuditLogEntry {
    pub osm_user_id: i64,
    pub section_id: i64,
    pub patrol_id: String,
    pub patrol_name: String,
    pub previous_score: i64,
    pub new_score: i64,
    pub points_added: i64,
    pub created_at: DateTime<Utc>,
}

/// Backoff schedule for outbox retries: `min(2^n, 480)` minutes, starting at
/// attempt 0 -> 1 minute. Returns `None` once `attempt_count` has exceeded
/// `MAX_ATTEMPTS`, meaning the row should be abandoned instead of retried
/// (a row gets exactly `MAX_ATTEMPTS` retries before abandonment).
pub fn retry_schedule(attempt_count: i32) -> Option<chrono::Duration> {
    if attempt_count > MAX_ATTEMPTS {
        return None;
    }
    let minutes = 2i64.saturating_pow(attempt_count.max(0) as u32).min(480);
    Some(chrono::Duration::minutes(minutes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_doubles_then_caps() {
        assert_eq!(retry_schedule(0), Some(chrono::Duration::minutes(1)));
        assert_eq!(retry_schedule(1), Some(chrono::Duration::minutes(2)));
        assert_eq!(retry_schedule(9), Some(chrono::Duration::minutes(480)));
    }

    #[test]
    fn retry_schedule_still_retries_on_the_max_attempts_th_try() {
        assert_eq!(retry_schedule(MAX_ATTEMPTS), Some(chrono::Duration::minutes(480)));
    }

    #[test]
    fn retry_schedule_abandons_once_max_attempts_exceeded() {
        assert_eq!(retry_schedule(MAX_ATTEMPTS + 1), None);
    }

    #[test]
    fn outbox_status_round_trips_through_db_strings() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::InFlight,
            OutboxStatus::Completed,
            OutboxStatus::Failed,
            OutboxStatus::Abandoned,
        ] {
            assert_eq!(OutboxStatus::from_db_str(status.as_db_str()), status);
        }
    }

    #[test]
    fn outbox_status_unknown_string_defaults_to_pending() {
        assert_eq!(OutboxStatus::from_db_str("something-unexpected"), OutboxStatus::Pending);
    }
}
