// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C6 - Credential Manager: long-lived per-OSM-user token custody used by
//! the sync worker when no interactive session exists. See spec §4.6.
//!
//! Schema:
//!
//! ```sql
//! create table user_credentials (
//!     osm_user_id   bigint primary key,
//!     access_token  text        not null,
//!     refresh_token text        not null,
//!     expires_at    timestamptz not null,
//!     last_used_at  timestamptz not null default now(),
//!     stale         boolean     not null default false
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::credential::oauth::TokenResponse;
use crate::credential::refresh::refresh_with_retries;
use crate::error::AppError;
use crate::types::UserCredential;

/// Refresh when expiry is within this horizon, matching C10's horizon.
const REFRESH_MARGIN: chrono::Duration = chrono::Duration::minutes(5);

pub struct CredentialManager {
    pool: PgPool,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl CredentialManager {
    pub fn new(pool: PgPool, http: reqwest::Client, osm_base_url: &str, client_id: String) -> Self {
        Self { pool, http, token_url: format!("{osm_base_url}/oauth/token"), client_id }
    }

    async fn load(&self, osm_user_id: i64) -> Result<Option<UserCredential>, AppError> {
        let row = sqlx::query(
            "select osm_user_id, access_token, refresh_token, expires_at, last_used_at, stale \
             from user_credentials where osm_user_id = $1",
        )
        .bind(osm_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(UserCredential {
            osm_user_id: row.try_get("osm_user_id").map_err(db_err)?,
            access_token: row.try_get("access_token").map_err(db_err)?,
            refresh_token: row.try_get("refresh_token").map_err(db_err)?,
            expires_at: row.try_get("expires_at").map_err(db_err)?,
            last_used_at: row.try_get("last_used_at").map_err(db_err)?,
            stale: row.try_get("stale").map_err(db_err)?,
        }))
    }

    async fn persist_refresh(&self, osm_user_id: i64, token: &TokenResponse) -> Result<(), AppError> {
        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in as i64);
        let refresh_token = token.refresh_token.clone().unwrap_or_default();
        sqlx::query(
            "update user_credentials set access_token = $2, refresh_token = $3, expires_at = $4 \
             where osm_user_id = $1",
        )
        .bind(osm_user_id)
        .bind(&token.access_token)
        .bind(&refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_revoked(&self, osm_user_id: i64) {
        let result = sqlx::query("update user_credentials set stale = true where osm_user_id = $1")
            .bind(osm_user_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(err = %e, osm_user_id, "failed to flag credential stale");
        }
    }

    /// Returns a usable access token, refreshing first if expiry is within
    /// [`REFRESH_MARGIN`] or already past.
    pub async fn get_access_token(&self, osm_user_id: i64) -> Result<String, AppError> {
        let Some(credential) = self.load(osm_user_id).await? else {
            return Err(AppError::CredentialsRevoked { user_id: osm_user_id });
        };
        if credential.stale {
            return Err(AppError::CredentialsRevoked { user_id: osm_user_id });
        }

        if credential.expires_at - Utc::now() > REFRESH_MARGIN {
            return Ok(credential.access_token);
        }

        match refresh_with_retries(
            &self.http,
            &self.token_url,
            &self.client_id,
            &credential.refresh_token,
            3,
        )
        .await
        {
            Ok(token) => {
                self.persist_refresh(osm_user_id, &token).await?;
                Ok(token.access_token)
            }
            Err(e) => {
                if is_invalid_grant(&e) {
                    self.mark_revoked(osm_user_id).await;
                    Err(AppError::CredentialsRevoked { user_id: osm_user_id })
                } else {
                    Err(AppError::TokenRefreshFailed(e.to_string()))
                }
            }
        }
    }

    pub async fn update_last_used(&self, osm_user_id: i64) {
        let result = sqlx::query("update user_credentials set last_used_at = now() where osm_user_id = $1")
            .bind(osm_user_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(err = %e, osm_user_id, "failed to touch credential last_used_at");
        }
    }

    /// Deletes credentials idle longer than `retention`. Run periodically
    /// from a background task.
    pub async fn purge_idle(&self, retention: chrono::Duration) -> Result<u64, AppError> {
        let cutoff: DateTime<Utc> = Utc::now() - retention;
        let result = sqlx::query("delete from user_credentials where last_used_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

/// OSM signals a revoked grant either with a 401 status or an
/// `invalid_grant` error body; `do_refresh` folds both into the error
/// message text, so this is a substring check rather than a typed match.
fn is_invalid_grant(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("401") || msg.contains("invalid_grant")
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Internal(format!("credential store: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_invalid_grant_by_status_or_body() {
        assert!(is_invalid_grant(&anyhow::anyhow!("refresh failed (401): unauthorized")));
        assert!(is_invalid_grant(&anyhow::anyhow!(
            "refresh failed (400): {\"error\":\"invalid_grant\"}"
        )));
        assert!(!is_invalid_grant(&anyhow::anyhow!("refresh failed (503): upstream unavailable")));
    }
}
