//! Core domain model and the pure sort/filter engine for FedScout.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fedscout-core";

/// Sentinel classification code meaning "query without a code filter and
/// post-filter against known contractor codes instead".
pub const WILDCARD_CODE: &str = "ALL";

/// Set-aside categories recognized in upstream free-text descriptions.
///
/// Detection order matters: `SDVOSB` must be checked before the generic
/// small-business match, so the variants are tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetAside {
    #[serde(rename = "SDVOSB")]
    Sdvosb,
    #[serde(rename = "WOSB")]
    Wosb,
    #[serde(rename = "HUBZone")]
    HubZone,
    #[serde(rename = "8(a)")]
    EightA,
    #[serde(rename = "Small Business")]
    SmallBusiness,
}

impl SetAside {
    pub const ALL: [SetAside; 5] = [
        SetAside::Sdvosb,
        SetAside::Wosb,
        SetAside::HubZone,
        SetAside::EightA,
        SetAside::SmallBusiness,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SetAside::Sdvosb => "SDVOSB",
            SetAside::Wosb => "WOSB",
            SetAside::HubZone => "HUBZone",
            SetAside::EightA => "8(a)",
            SetAside::SmallBusiness => "Small Business",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            SetAside::Sdvosb => &["sdvosb", "service-disabled"],
            SetAside::Wosb => &["wosb", "women"],
            SetAside::HubZone => &["hubzone"],
            SetAside::EightA => &["8(a)"],
            SetAside::SmallBusiness => &["small business"],
        }
    }

    /// Ordered substring match against an upstream set-aside description.
    /// First category to match wins; no match means no category.
    pub fn detect(description: &str) -> Option<SetAside> {
        let haystack = description.to_ascii_lowercase();
        SetAside::ALL
            .into_iter()
            .find(|category| category.keywords().iter().any(|kw| haystack.contains(kw)))
    }

    /// Parse a caller-supplied filter value by exact label match
    /// (case-insensitive). The `"all"` sentinel means "no filter".
    pub fn from_filter_param(param: &str) -> Option<SetAside> {
        SetAside::ALL
            .into_iter()
            .find(|category| category.label().eq_ignore_ascii_case(param))
    }
}

/// Canonical persisted opportunity representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    /// Upstream notice id, the upsert key.
    pub id: String,
    pub title: String,
    pub agency: String,
    pub classification_code: String,
    /// Calendar-date string, `YYYY-MM-DD` when the upstream value parsed.
    pub posted_date: String,
    pub response_deadline: String,
    /// Epoch milliseconds; always in the future at creation time.
    pub deadline_timestamp: i64,
    /// Human display string, e.g. `"$2.5M"` or `"TBD"`.
    pub display_value: String,
    /// Raw parsed amount used for sort/filter only; 0 when unknown.
    pub numeric_value: f64,
    #[serde(rename = "type")]
    pub notice_type: String,
    pub set_aside: Option<SetAside>,
    pub description: String,
    pub solicitation_number: Option<String>,
    pub url: String,
}

/// One append-only sync-log row. The newest row's timestamp is the sole
/// cache-freshness signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub synced_at: DateTime<Utc>,
    pub opportunity_count: i64,
    /// Comma-joined classification codes used for the cycle.
    pub codes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Deadline,
    Value,
    Posted,
}

impl SortKey {
    pub fn from_param(param: &str) -> SortKey {
        match param {
            "value" => SortKey::Value,
            "posted" => SortKey::Posted,
            _ => SortKey::Deadline,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Deadline => "deadline",
            SortKey::Value => "value",
            SortKey::Posted => "posted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn from_param(param: &str) -> SortDir {
        if param.eq_ignore_ascii_case("desc") {
            SortDir::Desc
        } else {
            SortDir::Asc
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }
}

/// Caller-requested filters and sort order, applied after normalization.
#[derive(Debug, Clone, Default)]
pub struct OpportunityQuery {
    pub set_aside: Option<SetAside>,
    pub min_value: Option<f64>,
    pub search: Option<String>,
    pub sort: SortKey,
    pub dir: SortDir,
}

/// Posted-date sort key; unparseable dates sort first.
fn posted_timestamp(opportunity: &Opportunity) -> i64 {
    NaiveDate::parse_from_str(&opportunity.posted_date, "%Y-%m-%d")
        .map(|d| {
            d.and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc()
                .timestamp_millis()
        })
        .unwrap_or(0)
}

/// Apply the optional filters, then a stable sort by the requested key and
/// direction. Ties keep input order in both directions, so descending is
/// sorted with a reversed key rather than by reversing the result.
pub fn apply_query(mut opportunities: Vec<Opportunity>, query: &OpportunityQuery) -> Vec<Opportunity> {
    if let Some(category) = query.set_aside {
        opportunities.retain(|o| o.set_aside == Some(category));
    }
    if let Some(min_value) = query.min_value {
        opportunities.retain(|o| o.numeric_value >= min_value);
    }
    if let Some(search) = query.search.as_deref() {
        let needle = search.to_lowercase();
        opportunities.retain(|o| {
            o.title.to_lowercase().contains(&needle)
                || o.agency.to_lowercase().contains(&needle)
                || o.classification_code.to_lowercase().contains(&needle)
        });
    }

    match (query.sort, query.dir) {
        (SortKey::Deadline, SortDir::Asc) => opportunities.sort_by_key(|o| o.deadline_timestamp),
        (SortKey::Deadline, SortDir::Desc) => {
            opportunities.sort_by_key(|o| std::cmp::Reverse(o.deadline_timestamp))
        }
        (SortKey::Value, SortDir::Asc) => {
            opportunities.sort_by(|a, b| a.numeric_value.total_cmp(&b.numeric_value))
        }
        (SortKey::Value, SortDir::Desc) => {
            opportunities.sort_by(|a, b| b.numeric_value.total_cmp(&a.numeric_value))
        }
        (SortKey::Posted, SortDir::Asc) => opportunities.sort_by_key(posted_timestamp),
        (SortKey::Posted, SortDir::Desc) => {
            opportunities.sort_by_key(|o| std::cmp::Reverse(posted_timestamp(o)))
        }
    }
    opportunities
}
