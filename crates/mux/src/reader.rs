// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! C3 - Profile/Term/Score Reader: higher-level read operations over C2.
//! See spec §4.3.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::AppError;
use crate::gateway::{OsmGateway, Principal, RequestOptions};
use crate::kv::Kv;
use crate::types::{PatrolScore, Profile, RateLimitInfo, Section, Term};

const PROFILE_CACHE_TTL_SECS: u64 = 600;

pub struct Reader {
    gateway: std::sync::Arc<OsmGateway>,
    kv: Kv,
}

#[derive(Deserialize)]
struct ProfileEnvelope {
    data: Profile,
}

impl Reader {
    pub fn new(gateway: std::sync::Arc<OsmGateway>, kv: Kv) -> Self {
        Self { gateway, kv }
    }

    /// GET `/oauth/resource`, cached under `osm_profile:{uid}` for 10 minutes.
    /// Corrupt cache entries are ignored and refreshed; cache-write failures
    /// never abort the call (best-effort only).
    pub async fn fetch_profile(&self, principal: &Principal) -> Result<Profile, AppError> {
        let cache_key = format!("osm_profile:{}", principal.user_id);

        if let Ok(Some(cached)) = self.kv.get(&cache_key).await {
            if let Ok(profile) = serde_json::from_str::<Profile>(&cached) {
                return Ok(profile);
            }
            tracing::warn!(user_id = principal.user_id, "corrupt profile cache entry, refreshing");
        }

        let (envelope, _rl): (ProfileEnvelope, Option<RateLimitInfo>) = self
            .gateway
            .request_json(reqwest::Method::GET, "/oauth/resource", RequestOptions {
                principal: Some(principal),
                ..Default::default()
            })
            .await?;

        if let Ok(serialized) = serde_json::to_string(&envelope.data) {
            if let Err(e) = self.kv.set_ex(&cache_key, &serialized, PROFILE_CACHE_TTL_SECS).await {
                tracing::warn!(err = %e, user_id = principal.user_id, "profile cache write failed");
            }
        }

        Ok(envelope.data)
    }

    /// A term is active when `start_date <= today <= end_date`, inclusive.
    /// Malformed dates are skipped with a WARN rather than aborting the scan.
    pub fn find_active_term<'a>(&self, section: &'a Section) -> Result<&'a Term, AppError> {
        let today = chrono::Utc::now().date_naive();
        for term in &section.terms {
            let (start, end) = match (parse_date(&term.startdate), parse_date(&term.enddate)) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    tracing::warn!(term_id = term.term_id, "malformed term dates, skipping");
                    continue;
                }
            };
            if start <= today && today <= end {
                return Ok(term);
            }
        }
        Err(AppError::NotInTerm { section_id: section.section_id })
    }

    /// GET patrols with `include_no_patrol=y`, filtered and sorted per
    /// spec §4.3.
    pub async fn fetch_patrol_scores(
        &self,
        principal: &Principal,
        section_id: i64,
        term_id: i64,
    ) -> Result<(Vec<PatrolScore>, Option<RateLimitInfo>), AppError> {
        let mut query = HashMap::new();
        query.insert("action", "getPatrolsWithPeople".to_owned());
        query.insert("sectionid", section_id.to_string());
        query.insert("termid", term_id.to_string());
        query.insert("include_no_patrol", "y".to_owned());

        let (raw, rate_limit_info): (HashMap<String, RawPatrol>, Option<RateLimitInfo>) = self
            .gateway
            .request_json(
                reqwest::Method::GET,
                "/ext/members/patrols/",
                RequestOptions { query, principal: Some(principal), ..Default::default() },
            )
            .await?;

        let mut patrols: Vec<PatrolScore> = raw
            .into_iter()
            .filter(|(id, _)| id != "unallocated")
            .filter(|(id, _)| !id.starts_with('-'))
            .filter(|(_, p)| !p.members.is_empty())
            .map(|(id, p)| {
                let score = p.points.parse::<i64>().unwrap_or_else(|_| {
                    tracing::warn!(patrol_id = %id, raw = %p.points, "unparseable patrol points, treating as 0");
                    0
                });
                PatrolScore { id, name: p.name, score }
            })
            .collect();

        patrols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((patrols, rate_limit_info))
    }

    /// Writes an absolute score (upstream has no delta endpoint).
    pub async fn update_patrol_score(
        &self,
        principal: &Principal,
        section_id: i64,
        patrol_id: &str,
        new_absolute_score: i64,
    ) -> Result<(), AppError> {
        let mut query = HashMap::new();
        query.insert("action", "updatePatrolPoints".to_owned());

        let body = format!(
            "sectionid={section_id}&patrolid={}&points={new_absolute_score}",
            urlencode_component(patrol_id)
        );

        self.gateway
            .request(
                reqwest::Method::POST,
                "/ext/members/patrols/",
                RequestOptions {
                    query,
                    principal: Some(principal),
                    body: Some(body),
                    content_type: Some("application/x-www-form-urlencoded"),
                    sensitive: false,
                },
            )
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawPatrol {
    name: String,
    points: String,
    #[serde(default)]
    members: Vec<serde_json::Value>,
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn urlencode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Term;

    fn term(id: i64, start: &str, end: &str) -> Term {
        Term { term_id: id, name: "t".into(), startdate: start.into(), enddate: end.into() }
    }

    fn reader_for_term_tests() -> Reader {
        // find_active_term doesn't touch the gateway/kv, so construction
        // details don't matter for these tests; a dummy gateway is never hit.
        let rate_limit: std::sync::Arc<dyn crate::ratelimit::RateLimitStore> =
            std::sync::Arc::new(crate::ratelimit::tests::InMemoryRateLimitStore::default());
        let gateway = std::sync::Arc::new(
            OsmGateway::new("http://unused.invalid".into(), rate_limit).expect("build gateway"),
        );
        let kv = Kv::connect("redis://127.0.0.1:6379").expect("build lazy redis pool");
        Reader::new(gateway, kv)
    }

    #[test]
    fn active_term_found_when_today_in_range() {
        let today = chrono::Utc::now().date_naive();
        let start = (today - chrono::Duration::days(10)).format("%Y-%m-%d").to_string();
        let end = (today + chrono::Duration::days(10)).format("%Y-%m-%d").to_string();
        let section =
            Section { section_id: 1, section_name: "s".into(), group_name: "g".into(), terms: vec![term(1, &start, &end)] };
        let reader = reader_for_term_tests();
        let found = reader.find_active_term(&section).unwrap();
        assert_eq!(found.term_id, 1);
    }

    #[test]
    fn no_active_term_is_err_not_in_term() {
        let section = Section {
            section_id: 1,
            section_name: "s".into(),
            group_name: "g".into(),
            terms: vec![term(1, "2020-01-01", "2020-02-01")],
        };
        let reader = reader_for_term_tests();
        assert!(matches!(reader.find_active_term(&section), Err(AppError::NotInTerm { section_id: 1 })));
    }

    #[test]
    fn malformed_term_is_skipped_not_fatal() {
        let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let section = Section {
            section_id: 1,
            section_name: "s".into(),
            group_name: "g".into(),
            terms: vec![term(1, "not-a-date", "also-not"), term(2, &today, &today)],
        };
        let reader = reader_for_term_tests();
        assert_eq!(reader.find_active_term(&section).unwrap().term_id, 2);
    }
}
