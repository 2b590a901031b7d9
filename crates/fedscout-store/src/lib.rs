//! Persistence seams for the opportunity cache: the store traits, the
//! Postgres implementation, and an in-memory backend for tests and local
//! runs without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedscout_core::{Opportunity, SetAside, SyncLogEntry};
use sqlx::{PgPool, Row};
use thiserror::Error;

pub const CRATE_NAME: &str = "fedscout-store";

/// Hard cap on rows served from the cache path.
pub const CACHE_ROW_LIMIT: i64 = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Read/write seam over the persisted opportunity cache and its sync log.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Rows with a deadline after `now_ms`, newest deadline first, capped.
    async fn cached_open(&self, now_ms: i64, limit: i64) -> Result<Vec<Opportunity>, StoreError>;

    /// Insert-or-update by notice id. Classification code and solicitation
    /// number are immutable once first seen. Returns the rows written.
    async fn upsert(&self, opportunities: &[Opportunity]) -> Result<usize, StoreError>;

    /// Delete every row whose deadline is at or before `now_ms`, whether or
    /// not this cycle touched it. Returns the rows removed.
    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError>;

    async fn last_sync(&self) -> Result<Option<SyncLogEntry>, StoreError>;

    async fn record_sync(&self, entry: &SyncLogEntry) -> Result<(), StoreError>;
}

/// Seam over the contractor-code lookup feeding the resolver.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// Distinct non-empty classification codes, at least four characters.
    async fn distinct_codes(&self) -> Result<Vec<String>, StoreError>;
}

fn set_aside_to_db(set_aside: Option<SetAside>) -> Option<&'static str> {
    set_aside.map(|s| s.label())
}

fn set_aside_from_db(value: Option<String>) -> Option<SetAside> {
    value.as_deref().and_then(SetAside::from_filter_param)
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    /// Bootstrap the cache schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                id                  TEXT PRIMARY KEY,
                title               TEXT NOT NULL,
                agency              TEXT NOT NULL,
                classification_code TEXT NOT NULL,
                posted_date         TEXT NOT NULL,
                response_deadline   TEXT NOT NULL,
                deadline_ts         BIGINT NOT NULL,
                display_value       TEXT NOT NULL,
                numeric_value       DOUBLE PRECISION NOT NULL,
                notice_type         TEXT NOT NULL,
                set_aside           TEXT,
                description         TEXT NOT NULL,
                solicitation_number TEXT,
                url                 TEXT NOT NULL,
                updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id                SERIAL PRIMARY KEY,
                synced_at         TIMESTAMPTZ NOT NULL,
                opportunity_count BIGINT NOT NULL,
                codes             TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contractors (
                id         SERIAL PRIMARY KEY,
                name       TEXT NOT NULL,
                naics_code TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_opportunity(row: &sqlx::postgres::PgRow) -> Result<Opportunity, StoreError> {
        Ok(Opportunity {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            agency: row.try_get("agency")?,
            classification_code: row.try_get("classification_code")?,
            posted_date: row.try_get("posted_date")?,
            response_deadline: row.try_get("response_deadline")?,
            deadline_timestamp: row.try_get("deadline_ts")?,
            display_value: row.try_get("display_value")?,
            numeric_value: row.try_get("numeric_value")?,
            notice_type: row.try_get("notice_type")?,
            set_aside: set_aside_from_db(row.try_get("set_aside")?),
            description: row.try_get("description")?,
            solicitation_number: row.try_get("solicitation_number")?,
            url: row.try_get("url")?,
        })
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn cached_open(&self, now_ms: i64, limit: i64) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, agency, classification_code, posted_date,
                   response_deadline, deadline_ts, display_value, numeric_value,
                   notice_type, set_aside, description, solicitation_number, url
              FROM opportunities
             WHERE deadline_ts > $1
             ORDER BY deadline_ts DESC
             LIMIT $2
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_opportunity).collect()
    }

    async fn upsert(&self, opportunities: &[Opportunity]) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for opportunity in opportunities {
            sqlx::query(
                r#"
                INSERT INTO opportunities (
                    id, title, agency, classification_code, posted_date,
                    response_deadline, deadline_ts, display_value, numeric_value,
                    notice_type, set_aside, description, solicitation_number, url,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    title             = EXCLUDED.title,
                    agency            = EXCLUDED.agency,
                    posted_date       = EXCLUDED.posted_date,
                    response_deadline = EXCLUDED.response_deadline,
                    deadline_ts       = EXCLUDED.deadline_ts,
                    display_value     = EXCLUDED.display_value,
                    numeric_value     = EXCLUDED.numeric_value,
                    notice_type       = EXCLUDED.notice_type,
                    set_aside         = EXCLUDED.set_aside,
                    description       = EXCLUDED.description,
                    url               = EXCLUDED.url,
                    updated_at        = NOW()
                "#,
            )
            .bind(&opportunity.id)
            .bind(&opportunity.title)
            .bind(&opportunity.agency)
            .bind(&opportunity.classification_code)
            .bind(&opportunity.posted_date)
            .bind(&opportunity.response_deadline)
            .bind(opportunity.deadline_timestamp)
            .bind(&opportunity.display_value)
            .bind(opportunity.numeric_value)
            .bind(&opportunity.notice_type)
            .bind(set_aside_to_db(opportunity.set_aside))
            .bind(&opportunity.description)
            .bind(&opportunity.solicitation_number)
            .bind(&opportunity.url)
            .execute(&self.pool)
            .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM opportunities WHERE deadline_ts <= $1")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn last_sync(&self) -> Result<Option<SyncLogEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT synced_at, opportunity_count, codes
              FROM sync_log
             ORDER BY synced_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SyncLogEntry {
                synced_at: row.try_get::<DateTime<Utc>, _>("synced_at")?,
                opportunity_count: row.try_get("opportunity_count")?,
                codes: row.try_get("codes")?,
            })
        })
        .transpose()
    }

    async fn record_sync(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sync_log (synced_at, opportunity_count, codes) VALUES ($1, $2, $3)")
            .bind(entry.synced_at)
            .bind(entry.opportunity_count)
            .bind(&entry.codes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CodeSource for PgStore {
    async fn distinct_codes(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT TRIM(naics_code) AS code
              FROM contractors
             WHERE naics_code IS NOT NULL
               AND LENGTH(TRIM(naics_code)) >= 4
             ORDER BY code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("code").map_err(StoreError::from))
            .collect()
    }
}

/// In-memory store for tests and database-less local runs. Same contract
/// as [`PgStore`], including the immutable-column upsert rule.
#[derive(Debug, Default)]
pub struct MemoryStore {
    opportunities: Mutex<HashMap<String, Opportunity>>,
    sync_log: Mutex<Vec<SyncLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.opportunities.lock().unwrap().len()
    }

    pub fn get(&self, id: &str) -> Option<Opportunity> {
        self.opportunities.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn cached_open(&self, now_ms: i64, limit: i64) -> Result<Vec<Opportunity>, StoreError> {
        let mut rows: Vec<Opportunity> = self
            .opportunities
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.deadline_timestamp > now_ms)
            .cloned()
            .collect();
        rows.sort_by_key(|o| std::cmp::Reverse(o.deadline_timestamp));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn upsert(&self, opportunities: &[Opportunity]) -> Result<usize, StoreError> {
        let mut map = self.opportunities.lock().unwrap();
        for opportunity in opportunities {
            match map.get_mut(&opportunity.id) {
                Some(existing) => {
                    existing.title = opportunity.title.clone();
                    existing.agency = opportunity.agency.clone();
                    existing.posted_date = opportunity.posted_date.clone();
                    existing.response_deadline = opportunity.response_deadline.clone();
                    existing.deadline_timestamp = opportunity.deadline_timestamp;
                    existing.display_value = opportunity.display_value.clone();
                    existing.numeric_value = opportunity.numeric_value;
                    existing.notice_type = opportunity.notice_type.clone();
                    existing.set_aside = opportunity.set_aside;
                    existing.description = opportunity.description.clone();
                    existing.url = opportunity.url.clone();
                }
                None => {
                    map.insert(opportunity.id.clone(), opportunity.clone());
                }
            }
        }
        Ok(opportunities.len())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError> {
        let mut map = self.opportunities.lock().unwrap();
        let before = map.len();
        map.retain(|_, o| o.deadline_timestamp > now_ms);
        Ok((before - map.len()) as u64)
    }

    async fn last_sync(&self) -> Result<Option<SyncLogEntry>, StoreError> {
        Ok(self.sync_log.lock().unwrap().last().cloned())
    }

    async fn record_sync(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        self.sync_log.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Fixed code list used by tests and by the resolver fallback path.
#[derive(Debug, Default)]
pub struct StaticCodeSource {
    codes: Vec<String>,
    fail: bool,
}

impl StaticCodeSource {
    pub fn new(codes: Vec<String>) -> Self {
        Self { codes, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            codes: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl CodeSource for StaticCodeSource {
    async fn distinct_codes(&self) -> Result<Vec<String>, StoreError> {
        if self.fail {
            return Err(StoreError::Message("code lookup unavailable".to_string()));
        }
        Ok(self.codes.clone())
    }
}
