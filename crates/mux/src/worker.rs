// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C8 - Sync Worker: the background loop that coalesces pending outbox
//! deltas per `(user, section, patrol)`, holds the distributed lock,
//! performs a read-modify-write against OSM, and handles partial failure
//! with bounded exponential backoff. See spec §4.8.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::credential::CredentialManager;
use crate::error::AppError;
use crate::gateway::Principal;
use crate::hub::Hub;
use crate::lock::DistributedLock;
use crate::outbox::OutboxStore;
use crate::reader::Reader;
use crate::types::{retry_schedule, OutboxEntry, ADHOC_SECTION_ID};

const PER_TUPLE_TIMEOUT: Duration = Duration::from_secs(120);
const LOCK_TTL: Duration = Duration::from_secs(60);

pub struct SyncWorker {
    outbox: Arc<OutboxStore>,
    lock: Arc<DistributedLock>,
    credentials: Arc<CredentialManager>,
    reader: Arc<Reader>,
    audit: Arc<AuditLog>,
    hub: Arc<Hub>,
    poll_interval: Duration,
}

impl SyncWorker {
    pub fn new(
        outbox: Arc<OutboxStore>,
        lock: Arc<DistributedLock>,
        credentials: Arc<CredentialManager>,
        reader: Arc<Reader>,
        audit: Arc<AuditLog>,
        hub: Arc<Hub>,
        poll_interval: Duration,
    ) -> Self {
        Self { outbox, lock, credentials, reader, audit, hub, poll_interval }
    }

    /// Runs until `shutdown` is cancelled. `OUTBOX_WORKERS` is documented as
    /// 1 by default to bound OSM load; callers may spawn more than one of
    /// these, each racing harmlessly on the same tuples via the lock.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn tick(&self) {
        let work = match self.outbox.list_work().await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(err = %e, "list_work failed, will retry next tick");
                return;
            }
        };

        for tuple in work {
            let guard = match self
                .lock
                .try_acquire(tuple.osm_user_id, tuple.section_id, &tuple.patrol_id, LOCK_TTL)
                .await
            {
                Ok(Some(g)) => g,
                Ok(None) => continue, // another worker holds it
                Err(e) => {
                    tracing::warn!(err = %e, "lock acquisition failed, skipping tuple this tick");
                    continue;
                }
            };

            let outcome = tokio::time::timeout(
                PER_TUPLE_TIMEOUT,
                self.process_tuple(tuple.osm_user_id, tuple.section_id, &tuple.patrol_id),
            )
            .await;

            self.lock.release(&guard).await;

            match outcome {
                Ok(ProcessOutcome::HaltCycle) => break,
                Ok(ProcessOutcome::Continue) => {}
                Err(_elapsed) => {
                    tracing::warn!(
                        osm_user_id = tuple.osm_user_id,
                        section_id = tuple.section_id,
                        patrol_id = %tuple.patrol_id,
                        "per-tuple work timed out"
                    );
                }
            }
        }
    }

    async fn process_tuple(&self, osm_user_id: i64, section_id: i64, patrol_id: &str) -> ProcessOutcome {
        let rows = match self.outbox.claim(osm_user_id, section_id, patrol_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(err = %e, osm_user_id, section_id, patrol_id, "claim failed");
                return ProcessOutcome::Continue;
            }
        };
        if rows.is_empty() {
            return ProcessOutcome::Continue;
        }

        if section_id == ADHOC_SECTION_ID {
            self.process_adhoc(osm_user_id, patrol_id, &rows).await;
            return ProcessOutcome::Continue;
        }

        match self.process_osm(osm_user_id, section_id, patrol_id, &rows).await {
            Ok(()) => ProcessOutcome::Continue,
            Err(AppError::ServiceBlocked) => {
                let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
                let retry_at = chrono::Utc::now() + chrono::Duration::hours(1);
                if let Err(e) = self.outbox.mark_failed(&ids, "service blocked", Some(retry_at)).await {
                    tracing::warn!(err = %e, "mark_failed after service-blocked also failed");
                }
                ProcessOutcome::HaltCycle
            }
            Err(other) => {
                self.handle_failure(&rows, other).await;
                ProcessOutcome::Continue
            }
        }
    }

    async fn process_osm(
        &self,
        osm_user_id: i64,
        section_id: i64,
        patrol_id: &str,
        rows: &[OutboxEntry],
    ) -> Result<(), AppError> {
        let access_token = self.credentials.get_access_token(osm_user_id).await?;
        let principal = Principal { user_id: osm_user_id, access_token };

        let profile = self.reader.fetch_profile(&principal).await?;
        let section = profile
            .sections
            .iter()
            .find(|s| s.section_id == section_id)
            .ok_or(AppError::NotInTerm { section_id })?;
        let term = self.reader.find_active_term(section)?;

        let (patrols, _rate_limit) =
            self.reader.fetch_patrol_scores(&principal, section_id, term.term_id).await?;
        let Some(patrol) = patrols.iter().find(|p| p.id == patrol_id) else {
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            self.outbox.mark_failed(&ids, "patrol not found", None).await?;
            return Ok(());
        };

        let delta: i64 = rows.iter().map(|r| r.points_delta).sum();
        let new_score = patrol.score + delta;

        self.reader.update_patrol_score(&principal, section_id, patrol_id, new_score).await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        self.outbox.mark_completed(&ids).await?;
        self.audit
            .append(
                osm_user_id,
                section_id,
                patrol_id,
                &patrol.name,
                patrol.score,
                new_score,
                delta,
            )
            .await;
        self.credentials.update_last_used(osm_user_id).await;
        self.hub.publish_section_refresh(section_id).await;
        Ok(())
    }

    /// Ad-hoc sections (sentinel `section_id == 0`) use a purely local
    /// mutation path: no term, no roster, no OSM round-trip. The broadcast
    /// routing key is scoped by user id to avoid cross-user leakage.
    async fn process_adhoc(&self, osm_user_id: i64, patrol_id: &str, rows: &[OutboxEntry]) {
        let delta: i64 = rows.iter().map(|r| r.points_delta).sum();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        if let Err(e) = self.outbox.mark_completed(&ids).await {
            tracing::warn!(err = %e, osm_user_id, patrol_id, "ad-hoc mark_completed failed");
            return;
        }
        self.audit.append(osm_user_id, ADHOC_SECTION_ID, patrol_id, patrol_id, 0, delta, delta).await;
        self.hub.publish_adhoc_refresh(osm_user_id).await;
    }

    async fn handle_failure(&self, rows: &[OutboxEntry], error: AppError) {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let attempt_count = rows.first().map(|r| r.attempt_count).unwrap_or(0);

        let (message, next_retry_at) = match &error {
            AppError::CredentialsRevoked { .. } => {
                ("credentials revoked".to_owned(), retry_schedule(attempt_count))
            }
            AppError::UserBlocked { blocked_until } => ("rate limited".to_owned(), Some(*blocked_until)),
            _ => (error.to_string(), retry_schedule(attempt_count)),
        };

        if let Err(e) = self.outbox.mark_failed(&ids, &message, next_retry_at).await {
            tracing::warn!(err = %e, "mark_failed itself failed");
        }
    }
}

enum ProcessOutcome {
    Continue,
    HaltCycle,
}
