// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C10 - Device Auth Context: authenticates a scoreboard device's bearer
//! token, refreshing its OSM token near expiry. See spec §4.10.
//!
//! Schema:
//!
//! ```sql
//! create table device_codes (
//!     device_code         text primary key,
//!     device_access_token text,
//!     osm_refresh_token   text,
//!     osm_access_token    text,
//!     osm_token_expires_at timestamptz,
//!     section_id          bigint,
//!     osm_user_id         bigint,
//!     last_used_at        timestamptz,
//!     created_at          timestamptz not null default now()
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::credential::refresh::refresh_with_retries;
use crate::error::AppError;
use crate::types::DeviceCode;

/// Refresh when expiry is within this horizon, matching C6's horizon.
const REFRESH_MARGIN: chrono::Duration = chrono::Duration::minutes(5);

/// An authenticated device, wrapping its [`DeviceCode`] row with the access
/// token to use for the current request.
pub struct AuthenticatedDevice {
    device: DeviceCode,
    access_token: String,
}

impl AuthenticatedDevice {
    pub fn user_id(&self) -> Option<i64> {
        self.device.osm_user_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn device(&self) -> &DeviceCode {
        &self.device
    }
}

pub struct DeviceAuthContext {
    pool: PgPool,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl DeviceAuthContext {
    pub fn new(pool: PgPool, http: reqwest::Client, osm_base_url: &str, client_id: String) -> Self {
        Self { pool, http, token_url: format!("{osm_base_url}/oauth/token"), client_id }
    }

    async fn load_by_access_token(&self, token: &str) -> Result<Option<DeviceCode>, AppError> {
        let row = sqlx::query(
            "select device_code, device_access_token, osm_refresh_token, osm_access_token, \
             osm_token_expires_at, section_id, osm_user_id, last_used_at, created_at \
             from device_codes where device_access_token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(DeviceCode {
            device_code: row.try_get("device_code").map_err(db_err)?,
            device_access_token: row.try_get("device_access_token").map_err(db_err)?,
            osm_refresh_token: row.try_get("osm_refresh_token").map_err(db_err)?,
            osm_access_token: row.try_get("osm_access_token").map_err(db_err)?,
            osm_token_expires_at: row.try_get("osm_token_expires_at").map_err(db_err)?,
            section_id: row.try_get("section_id").map_err(db_err)?,
            osm_user_id: row.try_get("osm_user_id").map_err(db_err)?,
            last_used_at: row.try_get("last_used_at").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
        }))
    }

    async fn persist_refresh(
        &self,
        device_code: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "update device_codes set osm_access_token = $2, osm_refresh_token = $3, \
             osm_token_expires_at = $4 where device_code = $1",
        )
        .bind(device_code)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Parses `Bearer <token>` out of an `Authorization` header value.
    pub async fn authenticate(&self, auth_header: Option<&str>) -> Result<AuthenticatedDevice, AppError> {
        let token = auth_header.and_then(|h| h.strip_prefix("Bearer ")).ok_or(AppError::InvalidToken)?;
        self.authenticate_token(token).await
    }

    /// Authenticates a device using its bearer token directly, bypassing
    /// the `Authorization` header framing (used by the WS upgrade, whose
    /// token arrives as a query parameter).
    pub async fn authenticate_token(&self, token: &str) -> Result<AuthenticatedDevice, AppError> {
        let device = self.load_by_access_token(token).await?.ok_or(AppError::InvalidToken)?;

        let (Some(refresh_token), Some(access_token), Some(expires_at)) =
            (device.osm_refresh_token.clone(), device.osm_access_token.clone(), device.osm_token_expires_at)
        else {
            return Err(AppError::TokenRevoked);
        };

        if expires_at - Utc::now() > REFRESH_MARGIN {
            return Ok(AuthenticatedDevice { device, access_token });
        }

        match refresh_with_retries(&self.http, &self.token_url, &self.client_id, &refresh_token, 1).await {
            Ok(refreshed) => {
                let new_expires_at = Utc::now() + chrono::Duration::seconds(refreshed.expires_in as i64);
                let new_refresh_token = refreshed.refresh_token.clone().unwrap_or(refresh_token);
                self.persist_refresh(
                    &device.device_code,
                    &refreshed.access_token,
                    &new_refresh_token,
                    new_expires_at,
                )
                .await?;
                Ok(AuthenticatedDevice { access_token: refreshed.access_token, device })
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("401") || msg.contains("invalid_grant") {
                    Err(AppError::TokenRevoked)
                } else {
                    Err(AppError::TokenRefreshFailed(msg))
                }
            }
        }
    }

    pub async fn update_last_used(&self, device_code: &str) {
        let result = sqlx::query("update device_codes set last_used_at = now() where device_code = $1")
            .bind(device_code)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(err = %e, device_code = %redact(device_code), "failed to touch device last_used_at");
        }
    }

    /// Deletes device codes that have never authenticated within
    /// `retention` of creation, or were last used longer than `retention`
    /// ago.
    pub async fn purge_unused(&self, retention: chrono::Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now() - retention;
        let result = sqlx::query(
            "delete from device_codes where coalesce(last_used_at, created_at) < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

fn redact(device_code: &str) -> String {
    device_code.chars().take(8).collect()
}

/// A DB failure here is always transient from the caller's perspective, so
/// it maps to [`AppError::StoreUnavailable`] (HTTP 503) rather than
/// [`AppError::Internal`] (HTTP 500), matching spec §4.10.
fn db_err(e: sqlx::Error) -> AppError {
    AppError::StoreUnavailable(format!("device auth store: {e}"))
}

/// HTTP-facing mapping of C10 errors per spec §4.10: invalid/revoked -> 401
/// with `WWW-Authenticate`; transient refresh/DB failure -> 503 with
/// `Retry-After: 60`.
pub fn www_authenticate_header() -> &'static str {
    r#"Bearer realm="API""#
}

/// `Retry-After` value (seconds) for the 503 arm of the C10 mapping.
pub const RETRY_AFTER_SECS: u64 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_only_first_eight_chars() {
        assert_eq!(redact("abcdefghijklmnop"), "abcdefgh");
        assert_eq!(redact("short"), "short");
    }

    #[test]
    fn www_authenticate_header_names_bearer_realm() {
        assert!(www_authenticate_header().starts_with("Bearer"));
    }
}
