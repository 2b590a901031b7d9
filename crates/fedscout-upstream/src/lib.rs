//! Upstream listings API surface: untrusted wire shapes, the rate-limited
//! batch fetcher, and normalization into canonical opportunities.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fedscout_core::{Opportunity, SetAside};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedscout-upstream";

/// Codes per sequential outer batch.
pub const OUTER_BATCH_SIZE: usize = 20;
/// Concurrent calls per inner batch; bounds upstream concurrency.
pub const INNER_BATCH_SIZE: usize = 5;
/// Pause between inner batches, per upstream rate-limit guidance.
pub const INNER_BATCH_DELAY: Duration = Duration::from_millis(200);
/// Shared wall-clock budget for one whole targeted fetch.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(20);
/// Posted-date lookback window, computed once per fetch cycle.
pub const LOOKBACK_DAYS: i64 = 120;
pub const TARGETED_PAGE_LIMIT: u32 = 100;
pub const WILDCARD_PAGE_LIMIT: u32 = 1000;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

const AGENCY_FALLBACK: &str = "Federal Agency";

/// Externally sourced record. Everything is optional; the upstream shape is
/// untrusted and partially populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawListing {
    pub notice_id: Option<String>,
    pub title: Option<String>,
    pub solicitation_number: Option<String>,
    /// Dot- or slash-delimited organization hierarchy path.
    pub full_parent_path_name: Option<String>,
    pub organization_name: Option<String>,
    pub naics_code: Option<String>,
    pub posted_date: Option<String>,
    pub response_dead_line: Option<String>,
    pub archive_date: Option<String>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    pub type_of_set_aside_description: Option<String>,
    pub description: Option<String>,
    pub ui_link: Option<String>,
    pub award: Option<RawAward>,
    /// Number or formatted string depending on the listing.
    pub estimated_total_value: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAward {
    pub amount: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchEnvelope {
    #[serde(default)]
    total_records: u64,
    #[serde(default)]
    opportunities_data: Vec<RawListing>,
}

/// One upstream query; `code` is absent in wildcard mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub code: Option<String>,
    pub posted_from: String,
    pub posted_to: String,
    pub limit: u32,
    pub offset: u32,
}

/// Posted-date range sent upstream, `MM/DD/YYYY` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateWindow {
    pub posted_from: String,
    pub posted_to: String,
}

impl DateWindow {
    /// Fixed lookback window anchored on one per-cycle `now` snapshot.
    pub fn lookback(now: DateTime<Utc>) -> Self {
        let from = now - chrono::Duration::days(LOOKBACK_DAYS);
        Self {
            posted_from: from.format("%m/%d/%Y").to_string(),
            posted_to: now.format("%m/%d/%Y").to_string(),
        }
    }

    pub fn query(&self, code: Option<String>, limit: u32) -> SearchQuery {
        SearchQuery {
            code,
            posted_from: self.posted_from.clone(),
            posted_to: self.posted_to.clone(),
            limit,
            offset: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch deadline exceeded")]
    DeadlineExceeded,
}

/// Seam over the upstream listings API; the batch fetcher and tests both
/// speak this trait.
#[async_trait]
pub trait ListingsApi: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawListing>, FetchError>;
}

/// reqwest-backed client for the SAM.gov-style opportunities endpoint.
#[derive(Debug, Clone)]
pub struct SamClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SamClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ListingsApi for SamClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawListing>, FetchError> {
        let url = format!("{}/opportunities/v2/search", self.base_url);
        let limit = query.limit.to_string();
        let offset = query.offset.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("api_key", self.api_key.as_str()),
            ("limit", limit.as_str()),
            ("offset", offset.as_str()),
            ("postedFrom", query.posted_from.as_str()),
            ("postedTo", query.posted_to.as_str()),
        ];
        if let Some(code) = query.code.as_deref() {
            params.push(("ncode", code));
        }

        let resp = self.client.get(&url).query(&params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let envelope: SearchEnvelope = resp.json().await?;
        tracing::debug!(
            total_records = envelope.total_records,
            returned = envelope.opportunities_data.len(),
            "upstream search page"
        );
        Ok(envelope.opportunities_data)
    }
}

/// Issues concurrent, rate-limited upstream queries under one shared
/// cancellation deadline. Partial upstream data beats no data: every
/// per-call failure degrades to an empty result for that code only.
pub struct BatchFetcher {
    api: Arc<dyn ListingsApi>,
    deadline: Duration,
}

impl BatchFetcher {
    pub fn new(api: Arc<dyn ListingsApi>) -> Self {
        Self {
            api,
            deadline: FETCH_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// One broad query without a code filter. Failure yields an empty
    /// result, never an error.
    pub async fn fetch_wildcard(&self, run_id: Uuid, window: &DateWindow) -> Vec<RawListing> {
        let query = window.query(None, WILDCARD_PAGE_LIMIT);
        async {
            match tokio::time::timeout(self.deadline, self.api.search(&query)).await {
                Ok(Ok(listings)) => listings,
                Ok(Err(err)) => {
                    warn!(%run_id, error = %err, "wildcard fetch failed; continuing with empty result");
                    Vec::new()
                }
                Err(_) => {
                    warn!(%run_id, "wildcard fetch hit the deadline; continuing with empty result");
                    Vec::new()
                }
            }
        }
        .instrument(info_span!("wildcard_fetch", %run_id))
        .await
    }

    /// Targeted fetch: outer batches run sequentially, the calls inside each
    /// inner batch run concurrently, and the whole phase shares one
    /// wall-clock deadline. Whatever accumulated when the deadline fires is
    /// returned as-is.
    pub async fn fetch_targeted(
        &self,
        run_id: Uuid,
        codes: &[String],
        window: &DateWindow,
    ) -> Vec<RawListing> {
        self.fetch_targeted_inner(run_id, codes, window)
            .instrument(info_span!("targeted_fetch", %run_id, codes = codes.len()))
            .await
    }

    async fn fetch_targeted_inner(
        &self,
        run_id: Uuid,
        codes: &[String],
        window: &DateWindow,
    ) -> Vec<RawListing> {
        let deadline = Instant::now() + self.deadline;
        let mut collected = Vec::new();

        let outer_batches: Vec<&[String]> = codes.chunks(OUTER_BATCH_SIZE).collect();
        'outer: for (outer_index, outer) in outer_batches.iter().enumerate() {
            let inner_batches: Vec<&[String]> = outer.chunks(INNER_BATCH_SIZE).collect();
            for (inner_index, inner) in inner_batches.iter().enumerate() {
                if Instant::now() >= deadline {
                    warn!(%run_id, fetched = collected.len(), "fetch deadline reached; skipping remaining batches");
                    break 'outer;
                }

                let mut tasks = JoinSet::new();
                for code in inner.iter() {
                    let api = Arc::clone(&self.api);
                    let query = window.query(Some(code.clone()), TARGETED_PAGE_LIMIT);
                    let code = code.clone();
                    tasks.spawn(async move {
                        let result = tokio::time::timeout_at(deadline, api.search(&query))
                            .await
                            .map_err(|_| FetchError::DeadlineExceeded)
                            .and_then(|inner| inner);
                        (code, result)
                    });
                }

                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((_, Ok(listings))) => collected.extend(listings),
                        Ok((code, Err(err))) => {
                            warn!(%run_id, code, error = %err, "per-code fetch failed; contributing nothing");
                        }
                        Err(err) => {
                            warn!(%run_id, error = %err, "fetch task panicked; contributing nothing");
                        }
                    }
                }

                // The delay sits between batches; the last one has nothing
                // to wait for.
                let last_batch = outer_index + 1 == outer_batches.len()
                    && inner_index + 1 == inner_batches.len();
                if !last_batch {
                    tokio::time::sleep(INNER_BATCH_DELAY).await;
                }
            }
        }

        collected
    }
}

/// Map an upstream record into a canonical opportunity. Returns `None` when
/// the listing is ineligible: no notice id, no usable deadline, or a
/// deadline at or before the cycle's `now` snapshot.
pub fn normalize(raw: &RawListing, now_ms: i64) -> Option<Opportunity> {
    let notice_id = raw.notice_id.as_deref()?.trim();
    if notice_id.is_empty() {
        return None;
    }

    // archiveDate stands in for an absent response deadline, as observed
    // upstream.
    let deadline_raw = raw
        .response_dead_line
        .as_deref()
        .or(raw.archive_date.as_deref())?;
    let deadline_timestamp = parse_timestamp_ms(deadline_raw)?;
    if deadline_timestamp <= now_ms {
        return None;
    }

    let numeric_value = raw
        .award
        .as_ref()
        .and_then(|a| a.amount.as_ref())
        .and_then(parse_amount)
        .or_else(|| raw.estimated_total_value.as_ref().and_then(parse_amount));

    Some(Opportunity {
        id: notice_id.to_string(),
        title: raw.title.clone().unwrap_or_else(|| "Untitled".to_string()),
        agency: derive_agency(raw),
        classification_code: raw.naics_code.clone().unwrap_or_default(),
        posted_date: raw
            .posted_date
            .as_deref()
            .map(normalize_date)
            .unwrap_or_default(),
        response_deadline: normalize_date(deadline_raw),
        deadline_timestamp,
        display_value: format_value(numeric_value),
        numeric_value: numeric_value.unwrap_or(0.0),
        notice_type: notice_type_label(raw.notice_type.as_deref()),
        set_aside: raw
            .type_of_set_aside_description
            .as_deref()
            .and_then(SetAside::detect),
        description: raw
            .description
            .as_deref()
            .map(sanitize_description)
            .unwrap_or_default(),
        solicitation_number: raw.solicitation_number.clone(),
        url: raw
            .ui_link
            .clone()
            .unwrap_or_else(|| format!("https://sam.gov/opp/{notice_id}/view")),
    })
}

/// Last non-empty segment of the parent-organization path; dot delimiter
/// first, slash as the alternate, then the flat organization name.
pub fn derive_agency(raw: &RawListing) -> String {
    if let Some(path) = raw.full_parent_path_name.as_deref() {
        let delimiter = if path.contains('.') { '.' } else { '/' };
        if let Some(segment) = path
            .split(delimiter)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .last()
        {
            return segment.to_string();
        }
    }
    raw.organization_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| AGENCY_FALLBACK.to_string())
}

/// Parse an upstream dollar amount that may arrive as a JSON number or a
/// formatted string.
pub fn parse_amount(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s.chars().filter(|c| !matches!(c, '$' | ',' | ' ')).collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// Human display string for a contract value: `"$2.5M"`, `"$750K"`,
/// `"$750"`, or `"TBD"` when unknown.
pub fn format_value(amount: Option<f64>) -> String {
    match amount {
        None => "TBD".to_string(),
        Some(v) if v >= 1_000_000.0 => format!("${:.1}M", v / 1_000_000.0),
        Some(v) if v >= 1_000.0 => format!("${}K", (v / 1_000.0).round()),
        Some(v) => format!("${v:.0}"),
    }
}

fn parse_timestamp_ms(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(
                date.and_hms_opt(0, 0, 0)
                    .expect("midnight is always valid")
                    .and_utc()
                    .timestamp_millis(),
            );
        }
    }
    None
}

/// Normalize to `YYYY-MM-DD`; an unparseable value passes through verbatim,
/// never errors.
pub fn normalize_date(input: &str) -> String {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return dt.format("%Y-%m-%d").to_string();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return dt.format("%Y-%m-%d").to_string();
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    trimmed.to_string()
}

/// Map the single-letter upstream status code to its label. Unknown codes
/// pass through verbatim; an absent code reads as a solicitation.
pub fn notice_type_label(code: Option<&str>) -> String {
    let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
        return "Solicitation".to_string();
    };
    match code.to_ascii_lowercase().as_str() {
        "o" => "Solicitation",
        "p" => "Pre-Solicitation",
        "r" => "Sources Sought",
        "k" => "Combined Synopsis/Solicitation",
        "a" => "Award Notice",
        "s" => "Special Notice",
        "i" => "Intent to Bundle Requirements",
        "g" => "Sale of Surplus Property",
        "u" => "Justification",
        _ => return code.to_string(),
    }
    .to_string()
}

/// Strip HTML, collapse whitespace runs, trim, and truncate.
pub fn sanitize_description(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let text: String = fragment.root_element().text().collect();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(DESCRIPTION_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn now_snapshot() -> (DateTime<Utc>, i64) {
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).single().unwrap();
        (now, now.timestamp_millis())
    }

    fn open_listing(id: &str) -> RawListing {
        RawListing {
            notice_id: Some(id.to_string()),
            title: Some("Network Modernization".to_string()),
            full_parent_path_name: Some(
                "GENERAL SERVICES ADMINISTRATION.FEDERAL ACQUISITION SERVICE.ITC".to_string(),
            ),
            naics_code: Some("541512".to_string()),
            posted_date: Some("2026-08-01".to_string()),
            response_dead_line: Some("2026-10-15T17:00:00-04:00".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn value_formatting_boundaries() {
        assert_eq!(format_value(None), "TBD");
        assert_eq!(format_value(Some(2_500_000.0)), "$2.5M");
        assert_eq!(format_value(Some(1_000_000.0)), "$1.0M");
        assert_eq!(format_value(Some(999_999.0)), "$1000K");
        assert_eq!(format_value(Some(750_000.0)), "$750K");
        assert_eq!(format_value(Some(1_000.0)), "$1K");
        assert_eq!(format_value(Some(999.0)), "$999");
        assert_eq!(format_value(Some(750.0)), "$750");
    }

    #[test]
    fn amount_parses_numbers_and_currency_strings() {
        assert_eq!(parse_amount(&serde_json::json!(2500000)), Some(2_500_000.0));
        assert_eq!(parse_amount(&serde_json::json!("$1,250,000.50")), Some(1_250_000.5));
        assert_eq!(parse_amount(&serde_json::json!("not a number")), None);
        assert_eq!(parse_amount(&serde_json::json!(null)), None);
    }

    #[test]
    fn award_amount_wins_over_estimated_total() {
        let (_, now_ms) = now_snapshot();
        let mut raw = open_listing("N-award");
        raw.award = Some(RawAward {
            amount: Some(serde_json::json!(2500000)),
        });
        raw.estimated_total_value = Some(serde_json::json!(10));

        let opportunity = normalize(&raw, now_ms).unwrap();
        assert_eq!(opportunity.display_value, "$2.5M");
        assert_eq!(opportunity.numeric_value, 2_500_000.0);
    }

    #[test]
    fn missing_value_displays_tbd_with_zero_numeric() {
        let (_, now_ms) = now_snapshot();
        let opportunity = normalize(&open_listing("N-tbd"), now_ms).unwrap();
        assert_eq!(opportunity.display_value, "TBD");
        assert_eq!(opportunity.numeric_value, 0.0);
    }

    #[test]
    fn dates_normalize_and_unparseable_passes_through() {
        assert_eq!(normalize_date("2026-10-15T17:00:00-04:00"), "2026-10-15");
        assert_eq!(normalize_date("10/15/2026"), "2026-10-15");
        assert_eq!(normalize_date("2026-10-15"), "2026-10-15");
        assert_eq!(normalize_date("sometime next fall"), "sometime next fall");
    }

    #[test]
    fn agency_takes_last_path_segment_with_fallbacks() {
        let mut raw = RawListing {
            full_parent_path_name: Some("DEPT OF DEFENSE.DEPT OF THE NAVY. NAVSEA ".to_string()),
            ..Default::default()
        };
        assert_eq!(derive_agency(&raw), "NAVSEA");

        raw.full_parent_path_name = Some("DOE/Office of Science".to_string());
        assert_eq!(derive_agency(&raw), "Office of Science");

        raw.full_parent_path_name = None;
        raw.organization_name = Some("  Small Business Administration ".to_string());
        assert_eq!(derive_agency(&raw), "Small Business Administration");

        raw.organization_name = None;
        assert_eq!(derive_agency(&raw), "Federal Agency");
    }

    #[test]
    fn notice_type_maps_letters_and_passes_unknown_through() {
        assert_eq!(notice_type_label(Some("o")), "Solicitation");
        assert_eq!(notice_type_label(Some("p")), "Pre-Solicitation");
        assert_eq!(notice_type_label(Some("r")), "Sources Sought");
        assert_eq!(notice_type_label(Some("k")), "Combined Synopsis/Solicitation");
        assert_eq!(notice_type_label(Some("a")), "Award Notice");
        assert_eq!(notice_type_label(Some("Special Thing")), "Special Thing");
        assert_eq!(notice_type_label(None), "Solicitation");
    }

    #[test]
    fn description_is_stripped_collapsed_and_truncated() {
        let html = "<p>Provide   <b>cloud</b> services.</p>\n\n<ul><li>24/7 support</li></ul>";
        assert_eq!(sanitize_description(html), "Provide cloud services. 24/7 support");

        let long = format!("<div>{}</div>", "word ".repeat(200));
        assert_eq!(sanitize_description(&long).chars().count(), DESCRIPTION_MAX_CHARS);
    }

    #[test]
    fn normalize_rejects_missing_id_and_expired_deadline() {
        let (_, now_ms) = now_snapshot();

        let mut raw = open_listing("N1");
        raw.notice_id = None;
        assert!(normalize(&raw, now_ms).is_none());

        let mut raw = open_listing("N1");
        raw.response_dead_line = Some("2001-01-01".to_string());
        raw.archive_date = None;
        assert!(normalize(&raw, now_ms).is_none());

        let mut raw = open_listing("N1");
        raw.response_dead_line = None;
        raw.archive_date = None;
        assert!(normalize(&raw, now_ms).is_none());
    }

    #[test]
    fn archive_date_backstops_a_missing_deadline() {
        let (_, now_ms) = now_snapshot();
        let mut raw = open_listing("N-archive");
        raw.response_dead_line = None;
        raw.archive_date = Some("2026-12-01".to_string());

        let opportunity = normalize(&raw, now_ms).unwrap();
        assert_eq!(opportunity.response_deadline, "2026-12-01");
        assert!(opportunity.deadline_timestamp > now_ms);
    }

    #[test]
    fn url_is_synthesized_when_upstream_omits_one() {
        let (_, now_ms) = now_snapshot();
        let opportunity = normalize(&open_listing("abc123"), now_ms).unwrap();
        assert_eq!(opportunity.url, "https://sam.gov/opp/abc123/view");

        let mut raw = open_listing("abc123");
        raw.ui_link = Some("https://sam.gov/opp/abc123/direct".to_string());
        let opportunity = normalize(&raw, now_ms).unwrap();
        assert_eq!(opportunity.url, "https://sam.gov/opp/abc123/direct");
    }

    #[test]
    fn set_aside_comes_from_the_upstream_description() {
        let (_, now_ms) = now_snapshot();
        let mut raw = open_listing("N-sa");
        raw.type_of_set_aside_description =
            Some("Service-Disabled Veteran-Owned Small Business Set-Aside".to_string());
        let opportunity = normalize(&raw, now_ms).unwrap();
        assert_eq!(opportunity.set_aside, Some(SetAside::Sdvosb));
    }

    #[test]
    fn wire_shape_deserializes_sam_field_names() {
        let raw: RawListing = serde_json::from_str(
            r#"{
                "noticeId": "W1",
                "title": "Widget Procurement",
                "responseDeadLine": "2026-11-30",
                "naicsCode": "334511",
                "typeOfSetAsideDescription": "Total Small Business Set-Aside",
                "uiLink": "https://sam.gov/opp/W1/view",
                "award": {"amount": "$42,000"}
            }"#,
        )
        .unwrap();
        assert_eq!(raw.notice_id.as_deref(), Some("W1"));
        assert_eq!(raw.response_dead_line.as_deref(), Some("2026-11-30"));
        assert_eq!(
            raw.award.as_ref().and_then(|a| a.amount.as_ref()).and_then(parse_amount),
            Some(42_000.0)
        );
    }

    struct ScriptedApi {
        // Maps a code to either listings or a failure; wildcard queries key on "".
        responses: Mutex<Vec<(String, Result<Vec<RawListing>, ()>)>>,
        delay: Duration,
    }

    #[async_trait]
    impl ListingsApi for ScriptedApi {
        async fn search(&self, query: &SearchQuery) -> Result<Vec<RawListing>, FetchError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let key = query.code.clone().unwrap_or_default();
            let scripted = self
                .responses
                .lock()
                .unwrap()
                .iter()
                .find(|(code, _)| *code == key)
                .map(|(_, result)| result.clone());
            match scripted {
                Some(Ok(listings)) => Ok(listings),
                _ => Err(FetchError::HttpStatus {
                    status: 500,
                    url: "https://example.test".to_string(),
                }),
            }
        }
    }

    fn scripted(responses: Vec<(&str, Result<Vec<RawListing>, ()>)>, delay: Duration) -> Arc<ScriptedApi> {
        Arc::new(ScriptedApi {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|(code, result)| (code.to_string(), result))
                    .collect(),
            ),
            delay,
        })
    }

    #[tokio::test]
    async fn per_code_failure_never_aborts_the_batch() {
        let api = scripted(
            vec![
                ("541511", Ok(vec![open_listing("A")])),
                ("541512", Err(())),
                ("541330", Ok(vec![open_listing("B"), open_listing("C")])),
            ],
            Duration::ZERO,
        );
        let fetcher = BatchFetcher::new(api);
        let (now, _) = now_snapshot();
        let window = DateWindow::lookback(now);

        let codes = vec!["541511".to_string(), "541512".to_string(), "541330".to_string()];
        let listings = fetcher.fetch_targeted(Uuid::new_v4(), &codes, &window).await;
        assert_eq!(listings.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_runs_between_inner_batches_but_not_after_the_last() {
        let api = scripted(vec![("541511", Ok(vec![open_listing("A")]))], Duration::ZERO);
        let fetcher = BatchFetcher::new(api);
        let (now, _) = now_snapshot();
        let window = DateWindow::lookback(now);

        // One inner batch: no delay at all.
        let start = Instant::now();
        let codes = vec!["541511".to_string()];
        let listings = fetcher.fetch_targeted(Uuid::new_v4(), &codes, &window).await;
        assert_eq!(listings.len(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Two inner batches: exactly one delay between them.
        let start = Instant::now();
        let codes: Vec<String> = (0..6).map(|i| format!("5415{i:02}")).collect();
        fetcher.fetch_targeted(Uuid::new_v4(), &codes, &window).await;
        assert_eq!(start.elapsed(), INNER_BATCH_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_deadline_short_circuits_remaining_batches() {
        // Every call takes longer than the whole fetch budget.
        let api = scripted(vec![("541511", Ok(vec![open_listing("A")]))], Duration::from_secs(60));
        let fetcher = BatchFetcher::new(api).with_deadline(Duration::from_secs(1));
        let (now, _) = now_snapshot();
        let window = DateWindow::lookback(now);

        let codes: Vec<String> = (0..12).map(|i| format!("5415{i:02}")).collect();
        let listings = fetcher.fetch_targeted(Uuid::new_v4(), &codes, &window).await;
        assert!(listings.is_empty());
    }

    #[tokio::test]
    async fn wildcard_failure_degrades_to_empty() {
        let api = scripted(vec![], Duration::ZERO);
        let fetcher = BatchFetcher::new(api);
        let (now, _) = now_snapshot();
        let window = DateWindow::lookback(now);

        let listings = fetcher.fetch_wildcard(Uuid::new_v4(), &window).await;
        assert!(listings.is_empty());
    }

    #[tokio::test]
    async fn wildcard_success_returns_unfiltered_listings() {
        let api = scripted(vec![("", Ok(vec![open_listing("W1"), open_listing("W2")]))], Duration::ZERO);
        let fetcher = BatchFetcher::new(api);
        let (now, _) = now_snapshot();
        let window = DateWindow::lookback(now);

        let listings = fetcher.fetch_wildcard(Uuid::new_v4(), &window).await;
        assert_eq!(listings.len(), 2);
    }

    #[test]
    fn lookback_window_uses_wire_date_format() {
        let (now, _) = now_snapshot();
        let window = DateWindow::lookback(now);
        assert_eq!(window.posted_to, "08/25/2026");
        assert_eq!(window.posted_from, "04/27/2026");
    }
}
