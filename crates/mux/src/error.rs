// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed error taxonomy shared across C1-C10.
//!
//! Every component-level operation fails with [`AppError`] rather than a bare
//! string, so middlewares and the sync worker can match on error kind instead
//! of parsing messages. HTTP status mapping only matters for the surfaces
//! this crate terminates itself (the WS upgrade); most call sites just match
//! on the variant to decide retry/backoff/cache-fallback behavior.

use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    /// Global OSM kill switch is set (`X-Blocked` was observed, or an
    /// operator set it directly). No OSM traffic may be attempted.
    #[error("service blocked")]
    ServiceBlocked,

    /// The given OSM user id is temporarily blocked (HTTP 429 observed).
    #[error("user blocked until {blocked_until}")]
    UserBlocked { blocked_until: DateTime<Utc> },

    /// The stored refresh token was rejected by OSM (invalid_grant / 401).
    #[error("credentials revoked for user {user_id}")]
    CredentialsRevoked { user_id: i64 },

    /// No term in `section.terms` covers today.
    #[error("section {section_id} is not currently in term")]
    NotInTerm { section_id: i64 },

    /// A requested patrol id was not present in the current roster.
    #[error("patrol {patrol_id} not found in section {section_id}")]
    PatrolNotFound { section_id: i64, patrol_id: String },

    /// Device bearer token missing, malformed, or unknown.
    #[error("invalid token")]
    InvalidToken,

    /// Device or session token revoked / credentials gone stale.
    #[error("token revoked")]
    TokenRevoked,

    /// Token was near/past expiry and the refresh attempt failed.
    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// Client-correctable validation failure (e.g. points out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network timeout, 5xx, or other retryable upstream failure.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Upstream returned a shape this system doesn't know how to interpret,
    /// which is a permanent per-entry failure with no retry.
    #[error("unexpected upstream data shape: {0}")]
    UpstreamDataShape(String),

    /// Response body failed to decode into the expected JSON target.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// Anything else: internal invariant violation, not meaningfully
    /// retryable by the caller.
    #[error("internal error: {0}")]
    Internal(String),

    /// A backing store (Postgres/Redis) failed while serving a request that
    /// spec §4.10 requires to surface as a transient, retryable failure
    /// rather than an internal error.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AppError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ServiceBlocked => 503,
            Self::UserBlocked { .. } => 429,
            Self::CredentialsRevoked { .. } => 401,
            Self::NotInTerm { .. } => 409,
            Self::PatrolNotFound { .. } => 404,
            Self::InvalidToken | Self::TokenRevoked => 401,
            Self::TokenRefreshFailed(_) => 503,
            Self::Validation(_) => 400,
            Self::Transient(_) => 503,
            Self::UpstreamDataShape(_) => 502,
            Self::Decode(_) => 502,
            Self::Internal(_) => 500,
            Self::StoreUnavailable(_) => 503,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceBlocked => "SERVICE_BLOCKED",
            Self::UserBlocked { .. } => "USER_BLOCKED",
            Self::CredentialsRevoked { .. } => "CREDENTIALS_REVOKED",
            Self::NotInTerm { .. } => "NOT_IN_TERM",
            Self::PatrolNotFound { .. } => "PATROL_NOT_FOUND",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::TokenRefreshFailed(_) => "TOKEN_REFRESH_FAILED",
            Self::Validation(_) => "VALIDATION",
            Self::Transient(_) => "TRANSIENT",
            Self::UpstreamDataShape(_) => "UPSTREAM_DATA_SHAPE",
            Self::Decode(_) => "DECODE",
            Self::Internal(_) => "INTERNAL",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    /// True for the categories the sync worker should retry with backoff
    /// rather than treat as a permanent per-entry failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::TokenRefreshFailed(_)
                | Self::Decode(_)
                | Self::Internal(_)
                | Self::StoreUnavailable(_)
        )
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(self.to_string()) };
        (status, Json(body))
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
