// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C2 - OSM Gateway: the single egress point to OSM. Enforces C1 gates,
//! decorates requests with auth, parses rate-limit/block headers, surfaces
//! typed errors, records latency. See spec §4.2.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::ratelimit::RateLimitStore;
use crate::types::RateLimitInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BLOCK_DURATION_SECS: i64 = 600;

/// An authenticated principal making an OSM request, supplying the user id
/// the rate-limit gates key on and the bearer token to attach.
pub struct Principal {
    pub user_id: i64,
    pub access_token: String,
}

/// Per-request options for [`OsmGateway::request`].
pub struct RequestOptions<'a> {
    pub query: HashMap<&'static str, String>,
    pub principal: Option<&'a Principal>,
    pub body: Option<String>,
    pub content_type: Option<&'static str>,
    /// Redacts response bodies in error logs (token endpoints).
    pub sensitive: bool,
}

impl Default for RequestOptions<'_> {
    fn default() -> Self {
        Self { query: HashMap::new(), principal: None, body: None, content_type: None, sensitive: false }
    }
}

/// Latency counter keyed by (endpoint, status), exposed at `/metrics`.
/// Ambient observability carried regardless of the REST-framing Non-goal
/// (spec §9's "LatencyRecorder" capability set).
#[derive(Default)]
pub struct LatencyRecorder {
    inner: std::sync::Mutex<HashMap<(String, u16), (u64, u64)>>,
}

impl LatencyRecorder {
    pub fn record(&self, endpoint: &str, status: u16, elapsed: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard.entry((endpoint.to_owned(), status)).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += elapsed.as_millis() as u64;
    }

    pub fn render_prometheus(&self) -> String {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for ((endpoint, status), (count, total_ms)) in guard.iter() {
            out.push_str(&format!(
                "osm_gateway_requests_total{{endpoint=\"{endpoint}\",status=\"{status}\"}} {count}\n"
            ));
            out.push_str(&format!(
                "osm_gateway_request_duration_ms_sum{{endpoint=\"{endpoint}\",status=\"{status}\"}} {total_ms}\n"
            ));
        }
        out
    }
}

/// The single egress point to OSM.
pub struct OsmGateway {
    client: reqwest::Client,
    base_url: String,
    rate_limit: Arc<dyn RateLimitStore>,
    pub latency: LatencyRecorder,
}

impl OsmGateway {
    pub fn new(base_url: String, rate_limit: Arc<dyn RateLimitStore>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("osmbridge/1.0")
            .build()?;
        Ok(Self { client, base_url, rate_limit, latency: LatencyRecorder::default() })
    }

    /// Metrics label for an endpoint: for the opaque `/api.php?action=X`
    /// style endpoints, the `action` query parameter is the label.
    fn endpoint_label(path: &str, query: &HashMap<&'static str, String>) -> String {
        query.get("action").cloned().unwrap_or_else(|| path.to_owned())
    }

    /// Decode a JSON response body into `T`. Fails without attempting the
    /// request when pre-flight gates reject it.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        options: RequestOptions<'_>,
    ) -> Result<(T, Option<RateLimitInfo>), AppError> {
        let (body, rate_limit_info) = self.request(method, path, options).await?;
        let decoded: T =
            serde_json::from_str(&body).map_err(|e| AppError::Decode(format!("{path}: {e}")))?;
        Ok((decoded, rate_limit_info))
    }

    /// Execute a request against OSM, enforcing C1 gates and parsing
    /// rate-limit / block headers. Returns the raw response body.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        options: RequestOptions<'_>,
    ) -> Result<(String, Option<RateLimitInfo>), AppError> {
        let endpoint = Self::endpoint_label(path, &options.query);

        // 1. Pre-flight gates.
        if self.rate_limit.is_service_blocked().await {
            self.latency.record(&endpoint, 503, Duration::ZERO);
            return Err(AppError::ServiceBlocked);
        }
        if let Some(principal) = options.principal {
            if let Some(blocked_until) = self.rate_limit.user_block_end(principal.user_id).await {
                if blocked_until > Utc::now() {
                    self.latency.record(&endpoint, 429, Duration::ZERO);
                    return Err(AppError::UserBlocked { blocked_until });
                }
            }
        }

        // 2. Build URL.
        let mut url = format!("{}{path}", self.base_url);
        if !options.query.is_empty() {
            let qs: Vec<String> = options
                .query
                .iter()
                .map(|(k, v)| format!("{k}={}", urlencode(v)))
                .collect();
            url.push(if path.contains('?') { '&' } else { '?' });
            url.push_str(&qs.join("&"));
        }

        let mut builder = self.client.request(method, &url);
        if let Some(principal) = options.principal {
            builder = builder.bearer_auth(&principal.access_token);
        }
        if let Some(ref body) = options.body {
            let content_type = options.content_type.unwrap_or("application/x-www-form-urlencoded");
            builder = builder.header("Content-Type", content_type).body(body.clone());
        }

        // 3. Execute with the 10s client-level timeout.
        let started = Instant::now();
        let resp = builder.send().await.map_err(|e| AppError::Transient(e.to_string()))?;
        let elapsed = started.elapsed();
        let status = resp.status();

        // 4. Global kill switch.
        if let Some(blocked_header) = resp.headers().get("x-blocked") {
            let reason = blocked_header.to_str().unwrap_or("").to_owned();
            self.rate_limit.mark_service_blocked().await;
            tracing::error!(critical = true, reason = %reason, "OSM signalled X-Blocked, halting all traffic");
            self.latency.record(&endpoint, status.as_u16(), elapsed);
            return Err(AppError::ServiceBlocked);
        }

        let rate_limit_info = parse_rate_limit_headers(resp.headers());
        if let (Some(info), Some(principal)) = (rate_limit_info, options.principal) {
            self.rate_limit
                .record_limits(
                    principal.user_id,
                    info.remaining,
                    info.limit,
                    (info.reset_at - Utc::now()).num_seconds(),
                )
                .await;
        }

        if resp.headers().contains_key("x-deprecated") {
            tracing::warn!(endpoint = %endpoint, "OSM endpoint marked deprecated");
        }

        // 5. 429 handling.
        if status.as_u16() == 429 {
            let blocked_until = compute_blocked_until(resp.headers());
            if let Some(principal) = options.principal {
                self.rate_limit.mark_user_blocked(principal.user_id, blocked_until).await;
            }
            self.latency.record(&endpoint, 429, elapsed);
            return Err(AppError::UserBlocked { blocked_until });
        }

        // 6. Other non-2xx.
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let truncated: String = text.chars().take(4096).collect();
            let logged = if options.sensitive { "[REDACTED]".to_owned() } else { truncated.clone() };
            tracing::error!(endpoint = %endpoint, status = status.as_u16(), body = %logged, "OSM request failed");
            self.latency.record(&endpoint, status.as_u16(), elapsed);
            return Err(AppError::Transient(format!("OSM {status} on {endpoint}")));
        }

        self.latency.record(&endpoint, status.as_u16(), elapsed);

        // First success after a block clears the global flag (spec scenario 3).
        if self.rate_limit.is_service_blocked().await {
            self.rate_limit.clear_service_blocked().await;
        }

        let body = resp.text().await.map_err(|e| AppError::Decode(e.to_string()))?;
        Ok((body, rate_limit_info))
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
    let limit = headers.get("x-ratelimit-limit")?.to_str().ok()?.parse().ok()?;
    let remaining = headers.get("x-ratelimit-remaining")?.to_str().ok()?.parse().ok()?;
    let reset_secs: i64 = headers.get("x-ratelimit-reset")?.to_str().ok()?.parse().ok()?;
    Some(RateLimitInfo { limit, remaining, reset_at: Utc::now() + chrono::Duration::seconds(reset_secs) })
}

/// Precedence per spec §4.2 step 5 / §9's Open Question resolution:
/// `Retry-After`, then `X-RateLimit-Reset`, then a 10-minute default.
fn compute_blocked_until(headers: &reqwest::header::HeaderMap) -> chrono::DateTime<Utc> {
    let seconds = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .or_else(|| {
            headers.get("x-ratelimit-reset").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<i64>().ok())
        })
        .unwrap_or(DEFAULT_BLOCK_DURATION_SECS);
    Utc::now() + chrono::Duration::seconds(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_label_prefers_action_query_param() {
        let mut query = HashMap::new();
        query.insert("action", "getPatrolsWithPeople".to_owned());
        assert_eq!(OsmGateway::endpoint_label("/ext/members/patrols/", &query), "getPatrolsWithPeople");
    }

    #[test]
    fn endpoint_label_falls_back_to_path() {
        let query = HashMap::new();
        assert_eq!(OsmGateway::endpoint_label("/oauth/resource", &query), "/oauth/resource");
    }

    #[test]
    fn blocked_until_prefers_retry_after_over_reset() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "120".parse().unwrap());
        headers.insert("x-ratelimit-reset", "9999".parse().unwrap());
        let before = Utc::now();
        let until = compute_blocked_until(&headers);
        let delta = (until - before).num_seconds();
        assert!((115..=125).contains(&delta), "expected ~120s, got {delta}");
    }

    #[test]
    fn blocked_until_falls_back_to_reset_then_default() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-reset", "45".parse().unwrap());
        let delta = (compute_blocked_until(&headers) - Utc::now()).num_seconds();
        assert!((40..=50).contains(&delta));

        let empty = reqwest::header::HeaderMap::new();
        let delta = (compute_blocked_until(&empty) - Utc::now()).num_seconds();
        assert!((DEFAULT_BLOCK_DURATION_SECS - 5..=DEFAULT_BLOCK_DURATION_SECS).contains(&delta));
    }
}
