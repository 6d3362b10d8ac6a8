// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable queue of pending score deltas backed by Postgres. See spec §3 and
//! §4.5.
//!
//! Schema (applied by migrations external to this crate):
//!
//! ```sql
//! create table score_update_outbox (
//!     id              bigserial primary key,
//!     idempotency_key text        not null,
//!     osm_user_id     bigint      not null,
//!     section_id      bigint      not null,
//!     patrol_id       text        not null,
//!     points_delta    bigint      not null,
//!     status          text        not null default 'pending',
//!     attempt_count   integer     not null default 0,
//!     next_retry_at   timestamptz,
//!     last_error      text,
//!     batch_id        text        not null,
//!     created_at      timestamptz not null default now(),
//!     processed_at    timestamptz,
//!     unique (idempotency_key, patrol_id)
//! );
//! create index score_update_outbox_work_idx
//!     on score_update_outbox (osm_user_id, section_id, patrol_id)
//!     where status = 'pending';
//! ```

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::AppError;
use crate::types::{OutboxEntry, OutboxStatus, WorkTuple, MAX_ATTEMPTS, MAX_POINTS_DELTA};

/// One entry to enqueue, as submitted by an admin write.
pub struct NewEntry {
    pub osm_user_id: i64,
    pub section_id: i64,
    pub patrol_id: String,
    pub points_delta: i64,
}

pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts one row per entry with `status=pending`. Duplicate
    /// `(idempotency_key, patrol_id)` pairs (client retries) are silently
    /// absorbed rather than re-inserted.
    pub async fn enqueue(
        &self,
        batch_id: &str,
        base_idempotency_key: &str,
        entries: &[NewEntry],
    ) -> Result<usize, AppError> {
        let mut created = 0usize;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for entry in entries {
            if entry.points_delta.abs() > MAX_POINTS_DELTA {
                return Err(AppError::Validation(format!(
                    "points_delta {} exceeds bound of {MAX_POINTS_DELTA}",
                    entry.points_delta
                )));
            }
            let row: Option<(i64,)> = sqlx::query_as(
                r#"
                insert into score_update_outbox
                    (idempotency_key, osm_user_id, section_id, patrol_id, points_delta, batch_id)
                values ($1, $2, $3, $4, $5, $6)
                on conflict (idempotency_key, patrol_id) do nothing
                returning id
                "#,
            )
            .bind(base_idempotency_key)
            .bind(entry.osm_user_id)
            .bind(entry.section_id)
            .bind(&entry.patrol_id)
            .bind(entry.points_delta)
            .bind(batch_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if row.is_some() {
                created += 1;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    /// Distinct `(user, section, patrol)` tuples with at least one pending
    /// row whose `next_retry_at` is null or in the past.
    pub async fn list_work(&self) -> Result<Vec<WorkTuple>, AppError> {
        let rows = sqlx::query(
            r#"
            select distinct osm_user_id, section_id, patrol_id
            from score_update_outbox
            where status = 'pending'
              and (next_retry_at is null or next_retry_at <= now())
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let osm_user_id: i64 = row.try_get("osm_user_id").map_err(db_err)?;
            let section_id: i64 = row.try_get("section_id").map_err(db_err)?;
            let patrol_id: String = row.try_get("patrol_id").map_err(db_err)?;
            out.push(WorkTuple { osm_user_id, section_id, patrol_id });
        }
        Ok(out)
    }

    /// Claims pending rows for `(user, section, patrol)` with
    /// `FOR UPDATE SKIP LOCKED`, marking them in-flight and incrementing
    /// their attempt count. Rows inserted after the claim but before commit
    /// remain pending for the next cycle.
    pub async fn claim(
        &self,
        osm_user_id: i64,
        section_id: i64,
        patrol_id: &str,
    ) -> Result<Vec<OutboxEntry>, AppError> {
        let rows = sqlx::query(
            r#"
            with to_claim as (
                select id
                from score_update_outbox
                where status = 'pending'
                  and osm_user_id = $1
                  and section_id = $2
                  and patrol_id = $3
                  and (next_retry_at is null or next_retry_at <= now())
                for update skip locked
            )
            update score_update_outbox
               set status = 'in-flight',
                   attempt_count = attempt_count + 1
             where id in (select id from to_claim)
            returning id, idempotency_key, osm_user_id, section_id, patrol_id, points_delta,
                      status, attempt_count, next_retry_at, last_error, batch_id, created_at,
                      processed_at
            "#,
        )
        .bind(osm_user_id)
        .bind(section_id)
        .bind(patrol_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(row_to_entry).collect()
    }

    /// Marks rows completed and stamps `processed_at`.
    pub async fn mark_completed(&self, ids: &[i64]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            update score_update_outbox
               set status = 'completed', processed_at = now()
             where id = any($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Reverts rows to `pending` with a retry time, `failed` when no retry
    /// is scheduled, or `abandoned` once `attempt_count` has exceeded
    /// [`MAX_ATTEMPTS`].
    pub async fn mark_failed(
        &self,
        ids: &[i64],
        error_msg: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            update score_update_outbox
               set last_error = $2,
                   next_retry_at = $3,
                   status = case
                       when attempt_count > $4 then 'abandoned'
                       when $3::timestamptz is null then 'failed'
                       else 'pending'
                   end
             where id = any($1)
            "#,
        )
        .bind(ids)
        .bind(error_msg)
        .bind(next_retry_at)
        .bind(MAX_ATTEMPTS)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn count_pending(&self, osm_user_id: i64) -> Result<i64, AppError> {
        let row = sqlx::query(
            "select count(*) as n from score_update_outbox where osm_user_id = $1 and status = 'pending'",
        )
        .bind(osm_user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get("n").map_err(db_err)
    }

    pub async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("delete from score_update_outbox where status = 'completed' and processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    pub async fn purge_failed(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "delete from score_update_outbox where status in ('failed', 'abandoned') and created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<OutboxEntry, AppError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(OutboxEntry {
        id: row.try_get("id").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        osm_user_id: row.try_get("osm_user_id").map_err(db_err)?,
        section_id: row.try_get("section_id").map_err(db_err)?,
        patrol_id: row.try_get("patrol_id").map_err(db_err)?,
        points_delta: row.try_get("points_delta").map_err(db_err)?,
        status: OutboxStatus::from_db_str(&status),
        attempt_count: row.try_get("attempt_count").map_err(db_err)?,
        next_retry_at: row.try_get("next_retry_at").map_err(db_err)?,
        last_error: row.try_get("last_error").map_err(db_err)?,
        batch_id: row.try_get("batch_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        processed_at: row.try_get("processed_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Internal(format!("outbox store: {e}"))
}
