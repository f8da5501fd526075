//! crates/lectern_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    BillingEvent, Document, Job, JobKind, JobStatus, Page, PeriodKind, PlaybackPosition, Sentence,
    TierConfig, UsagePeriod, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Usage limit reached for the current period")]
    QuotaExceeded,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- User and Tier Management ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn get_tier_config(&self, tier: &str) -> PortResult<TierConfig>;

    async fn update_user_tier(&self, user_id: Uuid, tier: &str) -> PortResult<()>;

    async fn update_billing_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> PortResult<()>;

    // --- Usage Accounting ---
    async fn get_usage_period(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> PortResult<Option<UsagePeriod>>;

    async fn insert_usage_period(&self, record: UsagePeriod) -> PortResult<UsagePeriod>;

    /// Re-snapshots the limit and period end from the current tier config
    /// without touching accumulated usage.
    async fn refresh_usage_snapshot(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        unit_limit: i64,
        period_end: Option<DateTime<Utc>>,
    ) -> PortResult<UsagePeriod>;

    /// Atomically adds `units` to the period's counter, re-validating the
    /// limit inside the same statement. Concurrent reservations for one
    /// user must serialize here; on violation nothing is mutated and
    /// `PortError::QuotaExceeded` is returned. With `enforce_limit` false
    /// (unlimited users) the increment is unconditional.
    async fn consume_units(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        units: i64,
        enforce_limit: bool,
    ) -> PortResult<UsagePeriod>;

    // --- Document Management ---
    async fn create_document(
        &self,
        user_id: Uuid,
        file_name: &str,
        storage_path: &str,
    ) -> PortResult<Document>;

    async fn get_document_by_id(&self, document_id: Uuid) -> PortResult<Document>;

    async fn set_document_text(&self, document_id: Uuid, parsed_text: &str) -> PortResult<()>;

    // --- Job Tracking ---
    async fn create_job(
        &self,
        document_id: Uuid,
        kind: JobKind,
        attempt_of: Option<Uuid>,
    ) -> PortResult<Job>;

    async fn get_job_by_id(&self, job_id: Uuid) -> PortResult<Job>;

    /// Most recently created job of the given kind, if any. Retries create
    /// new rows, so "latest by creation time" is the authoritative one.
    async fn get_latest_job(&self, document_id: Uuid, kind: JobKind) -> PortResult<Option<Job>>;

    async fn list_jobs(&self, document_id: Uuid, kind: JobKind) -> PortResult<Vec<Job>>;

    /// Applies a non-terminal status/progress update. Returns `None`
    /// without mutating when the job is already terminal.
    async fn update_job_progress(
        &self,
        job_id: Uuid,
        status: JobStatus,
        completion: i16,
    ) -> PortResult<Option<Job>>;

    /// Moves a job into a terminal state. Returns `None` without mutating
    /// when the job is already terminal.
    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result_ref: Option<&str>,
        error_detail: Option<&str>,
    ) -> PortResult<Option<Job>>;

    // --- Pages and Sentences ---
    async fn insert_page(&self, page: Page) -> PortResult<()>;

    async fn insert_sentences(&self, sentences: Vec<Sentence>) -> PortResult<()>;

    async fn list_pages(&self, document_id: Uuid) -> PortResult<Vec<Page>>;

    async fn list_sentences(&self, document_id: Uuid) -> PortResult<Vec<Sentence>>;

    async fn get_sentence(
        &self,
        document_id: Uuid,
        sequence: i64,
    ) -> PortResult<Option<Sentence>>;

    // --- Playback Position ---
    async fn upsert_playback_position(
        &self,
        document_id: Uuid,
        sentence_index: i64,
    ) -> PortResult<()>;

    async fn get_playback_position(
        &self,
        document_id: Uuid,
    ) -> PortResult<Option<PlaybackPosition>>;

    // --- Billing Event Intake ---
    /// Records a webhook delivery id. Returns `false` when the id was
    /// already processed, so intake stays idempotent under redelivery.
    async fn record_billing_event(&self, event_id: &str, kind: &str) -> PortResult<bool>;

    async fn set_billing_event_error(&self, event_id: &str, error: &str) -> PortResult<()>;

    async fn get_billing_event(&self, event_id: &str) -> PortResult<Option<BillingEvent>>;
}

#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Dispatches a page-by-page extraction job to the compute pool.
    /// `job_id` is our tracking row; the pool addresses its progress
    /// callbacks with it. Returns the pool's own task handle.
    async fn submit_extraction(&self, document: &Document, job_id: Uuid) -> PortResult<String>;

    /// Dispatches a full-document audio conversion job.
    async fn submit_conversion(&self, document: &Document, job_id: Uuid) -> PortResult<String>;
}

#[async_trait]
pub trait SpeechSynthesisService: Send + Sync {
    /// Synthesizes audio for a single sentence.
    async fn synthesize(&self, text: &str) -> PortResult<Vec<u8>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores a raw object (an upload or a finished audio artifact).
    async fn store(&self, path: &str, data: Vec<u8>, content_type: &str) -> PortResult<()>;

    /// Issues a time-limited access URL for a stored object.
    async fn signed_url(&self, path: &str, ttl_secs: u64) -> PortResult<String>;
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Plays one synthesized sentence, resolving at natural end-of-audio.
    async fn play(&self, audio: &[u8]) -> PortResult<()>;
}
