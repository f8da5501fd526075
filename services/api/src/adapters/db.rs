//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lectern_core::domain::{
    BillingEvent, Document, Job, JobKind, JobStatus, Page, PeriodKind, PlaybackPosition, Sentence,
    TierConfig, UsagePeriod, User,
};
use lectern_core::ports::{DatabaseService, PortError, PortResult};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: Option<String>,
    tier: String,
    unlimited_quota: bool,
    billing_period_start: Option<DateTime<Utc>>,
    billing_period_end: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            email: self.email,
            tier: self.tier,
            unlimited_quota: self.unlimited_quota,
            billing_period_start: self.billing_period_start,
            billing_period_end: self.billing_period_end,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct TierConfigRecord {
    tier: String,
    unit_limit: i64,
    period_kind: String,
}
impl TierConfigRecord {
    fn to_domain(self) -> PortResult<TierConfig> {
        let period_kind = PeriodKind::parse(&self.period_kind).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown period kind '{}'", self.period_kind))
        })?;
        Ok(TierConfig {
            tier: self.tier,
            unit_limit: self.unit_limit,
            period_kind,
        })
    }
}

#[derive(FromRow)]
struct UsagePeriodRecord {
    user_id: Uuid,
    period_kind: String,
    period_start: DateTime<Utc>,
    period_end: Option<DateTime<Utc>>,
    units_used: i64,
    unit_limit: i64,
}
impl UsagePeriodRecord {
    fn to_domain(self) -> PortResult<UsagePeriod> {
        let period_kind = PeriodKind::parse(&self.period_kind).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown period kind '{}'", self.period_kind))
        })?;
        Ok(UsagePeriod {
            user_id: self.user_id,
            period_kind,
            period_start: self.period_start,
            period_end: self.period_end,
            units_used: self.units_used,
            unit_limit: self.unit_limit,
        })
    }
}

#[derive(FromRow)]
struct DocumentRecord {
    id: Uuid,
    user_id: Uuid,
    file_name: String,
    storage_path: String,
    parsed_text: Option<String>,
    created_at: DateTime<Utc>,
}
impl DocumentRecord {
    fn to_domain(self) -> Document {
        Document {
            id: self.id,
            user_id: self.user_id,
            file_name: self.file_name,
            storage_path: self.storage_path,
            parsed_text: self.parsed_text,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct JobRecord {
    id: Uuid,
    document_id: Uuid,
    kind: String,
    status: String,
    completion: i16,
    error_detail: Option<String>,
    result_ref: Option<String>,
    attempt_of: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl JobRecord {
    fn to_domain(self) -> PortResult<Job> {
        let kind = JobKind::parse(&self.kind)
            .ok_or_else(|| PortError::Unexpected(format!("Unknown job kind '{}'", self.kind)))?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown job status '{}'", self.status))
        })?;
        Ok(Job {
            id: self.id,
            document_id: self.document_id,
            kind,
            status,
            completion: self.completion,
            error_detail: self.error_detail,
            result_ref: self.result_ref,
            attempt_of: self.attempt_of,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PageRecord {
    document_id: Uuid,
    page_number: i32,
    width: f64,
    height: f64,
    text: String,
}
impl PageRecord {
    fn to_domain(self) -> Page {
        Page {
            document_id: self.document_id,
            page_number: self.page_number,
            width: self.width,
            height: self.height,
            text: self.text,
        }
    }
}

#[derive(FromRow)]
struct SentenceRecord {
    document_id: Uuid,
    page_number: i32,
    sequence: i64,
    text: String,
    regions: serde_json::Value,
}
impl SentenceRecord {
    fn to_domain(self) -> PortResult<Sentence> {
        let regions = serde_json::from_value(self.regions)
            .map_err(|e| PortError::Unexpected(format!("Bad sentence geometry: {}", e)))?;
        Ok(Sentence {
            document_id: self.document_id,
            page_number: self.page_number,
            sequence: self.sequence,
            text: self.text,
            regions,
        })
    }
}

#[derive(FromRow)]
struct PlaybackPositionRecord {
    document_id: Uuid,
    sentence_index: i64,
}
impl PlaybackPositionRecord {
    fn to_domain(self) -> PlaybackPosition {
        PlaybackPosition {
            document_id: self.document_id,
            sentence_index: self.sentence_index,
        }
    }
}

#[derive(FromRow)]
struct BillingEventRecord {
    event_id: String,
    kind: String,
    received_at: DateTime<Utc>,
    error: Option<String>,
}
impl BillingEventRecord {
    fn to_domain(self) -> BillingEvent {
        BillingEvent {
            event_id: self.event_id,
            kind: self.kind,
            received_at: self.received_at,
            error: self.error,
        }
    }
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, email, tier, unlimited_quota, billing_period_start, billing_period_end, created_at \
             FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", user_id)),
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<User> {
        sqlx::query("INSERT INTO users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        self.get_user(user_id).await
    }

    async fn get_tier_config(&self, tier: &str) -> PortResult<TierConfig> {
        let record = sqlx::query_as::<_, TierConfigRecord>(
            "SELECT tier, unit_limit, period_kind FROM tier_configs WHERE tier = $1",
        )
        .bind(tier)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                // A tier without a config row is a deployment bug, not a
                // user-facing condition.
                PortError::Unexpected(format!("No tier config row for tier '{}'", tier))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn update_user_tier(&self, user_id: Uuid, tier: &str) -> PortResult<()> {
        sqlx::query("UPDATE users SET tier = $1 WHERE user_id = $2")
            .bind(tier)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn update_billing_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE users SET billing_period_start = $1, billing_period_end = $2 WHERE user_id = $3",
        )
        .bind(period_start)
        .bind(period_end)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn get_usage_period(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> PortResult<Option<UsagePeriod>> {
        let record = sqlx::query_as::<_, UsagePeriodRecord>(
            "SELECT user_id, period_kind, period_start, period_end, units_used, unit_limit \
             FROM usage_periods WHERE user_id = $1 AND period_kind = $2 AND period_start = $3",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(|r| r.to_domain()).transpose()
    }

    async fn insert_usage_period(&self, record: UsagePeriod) -> PortResult<UsagePeriod> {
        // Two callers may race on first access to a period; the conflict
        // arm turns the loser into a snapshot refresh.
        let inserted = sqlx::query_as::<_, UsagePeriodRecord>(
            "INSERT INTO usage_periods (user_id, period_kind, period_start, period_end, units_used, unit_limit) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id, period_kind, period_start) DO UPDATE \
             SET period_end = EXCLUDED.period_end, unit_limit = EXCLUDED.unit_limit \
             RETURNING user_id, period_kind, period_start, period_end, units_used, unit_limit",
        )
        .bind(record.user_id)
        .bind(record.period_kind.as_str())
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.units_used)
        .bind(record.unit_limit)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        inserted.to_domain()
    }

    async fn refresh_usage_snapshot(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        unit_limit: i64,
        period_end: Option<DateTime<Utc>>,
    ) -> PortResult<UsagePeriod> {
        let record = sqlx::query_as::<_, UsagePeriodRecord>(
            "UPDATE usage_periods SET unit_limit = $4, period_end = $5 \
             WHERE user_id = $1 AND period_kind = $2 AND period_start = $3 \
             RETURNING user_id, period_kind, period_start, period_end, units_used, unit_limit",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(period_start)
        .bind(unit_limit)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!(
                "Usage period for user {} starting {} not found",
                user_id, period_start
            )),
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn consume_units(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        units: i64,
        enforce_limit: bool,
    ) -> PortResult<UsagePeriod> {
        // Single conditional UPDATE: the limit re-check and the increment
        // happen in one statement, so concurrent reservations serialize on
        // the row and cannot jointly overshoot.
        let record = sqlx::query_as::<_, UsagePeriodRecord>(
            "UPDATE usage_periods SET units_used = units_used + $4 \
             WHERE user_id = $1 AND period_kind = $2 AND period_start = $3 \
               AND (NOT $5 OR units_used + $4 <= unit_limit) \
             RETURNING user_id, period_kind, period_start, period_end, units_used, unit_limit",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(period_start)
        .bind(units)
        .bind(enforce_limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        match record {
            Some(r) => r.to_domain(),
            None if enforce_limit => Err(PortError::QuotaExceeded),
            None => Err(PortError::NotFound(format!(
                "Usage period for user {} starting {} not found",
                user_id, period_start
            ))),
        }
    }

    async fn create_document(
        &self,
        user_id: Uuid,
        file_name: &str,
        storage_path: &str,
    ) -> PortResult<Document> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "INSERT INTO documents (id, user_id, file_name, storage_path) VALUES ($1, $2, $3, $4) \
             RETURNING id, user_id, file_name, storage_path, parsed_text, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(file_name)
        .bind(storage_path)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn get_document_by_id(&self, document_id: Uuid) -> PortResult<Document> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, user_id, file_name, storage_path, parsed_text, created_at \
             FROM documents WHERE id = $1",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Document {} not found", document_id))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn set_document_text(&self, document_id: Uuid, parsed_text: &str) -> PortResult<()> {
        sqlx::query("UPDATE documents SET parsed_text = $1 WHERE id = $2")
            .bind(parsed_text)
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn create_job(
        &self,
        document_id: Uuid,
        kind: JobKind,
        attempt_of: Option<Uuid>,
    ) -> PortResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            "INSERT INTO jobs (id, document_id, kind, status, completion, attempt_of) \
             VALUES ($1, $2, $3, 'pending', 0, $4) \
             RETURNING id, document_id, kind, status, completion, error_detail, result_ref, attempt_of, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(document_id)
        .bind(kind.as_str())
        .bind(attempt_of)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> PortResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT id, document_id, kind, status, completion, error_detail, result_ref, attempt_of, created_at, updated_at \
             FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Job {} not found", job_id)),
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn get_latest_job(&self, document_id: Uuid, kind: JobKind) -> PortResult<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT id, document_id, kind, status, completion, error_detail, result_ref, attempt_of, created_at, updated_at \
             FROM jobs WHERE document_id = $1 AND kind = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(document_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(|r| r.to_domain()).transpose()
    }

    async fn list_jobs(&self, document_id: Uuid, kind: JobKind) -> PortResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT id, document_id, kind, status, completion, error_detail, result_ref, attempt_of, created_at, updated_at \
             FROM jobs WHERE document_id = $1 AND kind = $2 \
             ORDER BY created_at DESC",
        )
        .bind(document_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        status: JobStatus,
        completion: i16,
    ) -> PortResult<Option<Job>> {
        // Terminal rows are filtered out by the WHERE clause, so a stale
        // worker message can never reopen a finished job.
        let record = sqlx::query_as::<_, JobRecord>(
            "UPDATE jobs SET status = $2, completion = $3, updated_at = now() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING id, document_id, kind, status, completion, error_detail, result_ref, attempt_of, created_at, updated_at",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(completion)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(|r| r.to_domain()).transpose()
    }

    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result_ref: Option<&str>,
        error_detail: Option<&str>,
    ) -> PortResult<Option<Job>> {
        let completion: i16 = if status == JobStatus::Completed { 100 } else { 0 };
        let record = sqlx::query_as::<_, JobRecord>(
            "UPDATE jobs SET status = $2, completion = $3, result_ref = $4, error_detail = $5, updated_at = now() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING id, document_id, kind, status, completion, error_detail, result_ref, attempt_of, created_at, updated_at",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(completion)
        .bind(result_ref)
        .bind(error_detail)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(|r| r.to_domain()).transpose()
    }

    async fn insert_page(&self, page: Page) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO pages (document_id, page_number, width, height, text) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(page.document_id)
        .bind(page.page_number)
        .bind(page.width)
        .bind(page.height)
        .bind(page.text)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn insert_sentences(&self, sentences: Vec<Sentence>) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        for sentence in sentences {
            let regions = serde_json::to_value(&sentence.regions)
                .map_err(|e| PortError::Unexpected(format!("Bad sentence geometry: {}", e)))?;
            sqlx::query(
                "INSERT INTO sentences (document_id, page_number, sequence, text, regions) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(sentence.document_id)
            .bind(sentence.page_number)
            .bind(sentence.sequence)
            .bind(sentence.text)
            .bind(regions)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn list_pages(&self, document_id: Uuid) -> PortResult<Vec<Page>> {
        let records = sqlx::query_as::<_, PageRecord>(
            "SELECT document_id, page_number, width, height, text \
             FROM pages WHERE document_id = $1 ORDER BY page_number ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn list_sentences(&self, document_id: Uuid) -> PortResult<Vec<Sentence>> {
        let records = sqlx::query_as::<_, SentenceRecord>(
            "SELECT document_id, page_number, sequence, text, regions \
             FROM sentences WHERE document_id = $1 ORDER BY sequence ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn get_sentence(
        &self,
        document_id: Uuid,
        sequence: i64,
    ) -> PortResult<Option<Sentence>> {
        let record = sqlx::query_as::<_, SentenceRecord>(
            "SELECT document_id, page_number, sequence, text, regions \
             FROM sentences WHERE document_id = $1 AND sequence = $2",
        )
        .bind(document_id)
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(|r| r.to_domain()).transpose()
    }

    async fn upsert_playback_position(
        &self,
        document_id: Uuid,
        sentence_index: i64,
    ) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO playback_positions (document_id, sentence_index) VALUES ($1, $2) \
             ON CONFLICT (document_id) DO UPDATE SET sentence_index = EXCLUDED.sentence_index",
        )
        .bind(document_id)
        .bind(sentence_index)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn get_playback_position(
        &self,
        document_id: Uuid,
    ) -> PortResult<Option<PlaybackPosition>> {
        let record = sqlx::query_as::<_, PlaybackPositionRecord>(
            "SELECT document_id, sentence_index FROM playback_positions WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn record_billing_event(&self, event_id: &str, kind: &str) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO billing_events (event_id, kind) VALUES ($1, $2) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(kind)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_billing_event_error(&self, event_id: &str, error: &str) -> PortResult<()> {
        sqlx::query("UPDATE billing_events SET error = $1 WHERE event_id = $2")
            .bind(error)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn get_billing_event(&self, event_id: &str) -> PortResult<Option<BillingEvent>> {
        let record = sqlx::query_as::<_, BillingEventRecord>(
            "SELECT event_id, kind, received_at, error FROM billing_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(|r| r.to_domain()))
    }
}
