// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only audit trail of applied score changes. See spec §3.
//!
//! Schema:
//!
//! ```sql
//! create table score_audit_log (
//!     id             bigserial primary key,
//!     osm_user_id    bigint      not null,
//!     section_id     bigint      not null,
//!     patrol_id      text        not null,
//!     patrol_name    text        not null,
//!     previous_score bigint      not null,
//!     new_score      bigint      not null,
//!     points_added   bigint      not null,
//!     created_at     timestamptz not null default now()
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Appends one record. Failures are logged, not propagated: a missed
    /// audit row must never roll back an already-applied OSM write.
    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        osm_user_id: i64,
        section_id: i64,
        patrol_id: &str,
        patrol_name: &str,
        previous_score: i64,
        new_score: i64,
        points_added: i64,
    ) {
        let result = sqlx::query(
            "insert into score_audit_log \
             (osm_user_id, section_id, patrol_id, patrol_name, previous_score, new_score, points_added) \
             values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(osm_user_id)
        .bind(section_id)
        .bind(patrol_id)
        .bind(patrol_name)
        .bind(previous_score)
        .bind(new_score)
        .bind(points_added)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(err = %e, osm_user_id, section_id, patrol_id, "audit log append failed");
        }
    }

    pub async fn purge_older_than(&self, retention: chrono::Duration) -> anyhow::Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - retention;
        let result = sqlx::query("delete from score_audit_log where created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
