//! services/api/src/web/protocol.rs
//!
//! Defines the wire payloads exchanged with browser clients (REST views)
//! and with the compute pool (progress callbacks).

use chrono::{DateTime, Utc};
use lectern_core::domain::{Job, JobKind, JobStatus, Page, Sentence, UsagePeriod};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Shared Enum Views
//=========================================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKindView {
    Extraction,
    Conversion,
}

impl From<JobKindView> for JobKind {
    fn from(v: JobKindView) -> Self {
        match v {
            JobKindView::Extraction => JobKind::Extraction,
            JobKindView::Conversion => JobKind::Conversion,
        }
    }
}

impl From<JobKind> for JobKindView {
    fn from(k: JobKind) -> Self {
        match k {
            JobKind::Extraction => JobKindView::Extraction,
            JobKind::Conversion => JobKindView::Conversion,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusView {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<JobStatus> for JobStatusView {
    fn from(s: JobStatus) -> Self {
        match s {
            JobStatus::Pending => JobStatusView::Pending,
            JobStatus::Running => JobStatusView::Running,
            JobStatus::Completed => JobStatusView::Completed,
            JobStatus::Failed => JobStatusView::Failed,
        }
    }
}

//=========================================================================================
// Client-Facing Requests and Views
//=========================================================================================

/// Submission request for a new pipeline job.
#[derive(Deserialize, Debug, ToSchema)]
pub struct SubmitJobRequest {
    pub document_id: Uuid,
    pub kind: JobKindView,
}

/// The response payload sent after a successful submission.
#[derive(Serialize, ToSchema)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

/// The response payload sent after a document upload.
#[derive(Serialize, ToSchema)]
pub struct UploadDocumentResponse {
    pub document_id: Uuid,
}

/// Poll-safe view of one job's state.
#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct JobView {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub kind: JobKindView,
    pub status: JobStatusView,
    pub completion: i16,
    pub error_detail: Option<String>,
    pub result_ref: Option<String>,
    /// Signed access URL for the finished artifact, when one exists.
    pub artifact_url: Option<String>,
    pub attempt_of: Option<Uuid>,
    /// True once enough of the document has been extracted for progressive
    /// rendering and sentence playback.
    pub partial_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobView {
    pub fn from_job(job: Job, artifact_url: Option<String>) -> Self {
        Self {
            job_id: job.id,
            document_id: job.document_id,
            kind: job.kind.into(),
            status: job.status.into(),
            completion: job.completion,
            error_detail: job.error_detail.clone(),
            result_ref: job.result_ref.clone(),
            artifact_url,
            attempt_of: job.attempt_of,
            partial_available: job.partial_available(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// View of the caller's current usage window.
#[derive(Serialize, Debug, ToSchema)]
pub struct UsageView {
    pub period_kind: String,
    pub period_start: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
    pub units_used: i64,
    pub unit_limit: i64,
    pub units_remaining: i64,
}

impl From<UsagePeriod> for UsageView {
    fn from(u: UsagePeriod) -> Self {
        Self {
            period_kind: u.period_kind.as_str().to_string(),
            period_start: u.period_start,
            period_end: u.period_end,
            units_used: u.units_used,
            unit_limit: u.unit_limit,
            units_remaining: (u.unit_limit - u.units_used).max(0),
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
pub struct PageView {
    pub page_number: i32,
    pub width: f64,
    pub height: f64,
    pub text: String,
}

impl From<Page> for PageView {
    fn from(p: Page) -> Self {
        Self {
            page_number: p.page_number,
            width: p.width,
            height: p.height,
            text: p.text,
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
pub struct SentenceView {
    pub sequence: i64,
    pub page_number: i32,
    pub text: String,
    /// Highlight polygons, one quadrilateral per spanned visual line.
    #[schema(value_type = Vec<Vec<Vec<f64>>>)]
    pub regions: Vec<Vec<[f64; 2]>>,
}

impl From<Sentence> for SentenceView {
    fn from(s: Sentence) -> Self {
        Self {
            sequence: s.sequence,
            page_number: s.page_number,
            text: s.text,
            regions: s.regions,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, ToSchema)]
pub struct PositionUpdateRequest {
    pub sentence_index: i64,
}

#[derive(Serialize, Debug, ToSchema)]
pub struct PositionView {
    pub sentence_index: i64,
}

//=========================================================================================
// Worker Callback Payloads
//=========================================================================================
// The compute pool reports back over plain JSON POSTs; these never appear
// in the public OpenAPI surface.
//=========================================================================================

#[derive(Deserialize, Debug)]
pub struct SentencePayload {
    pub sequence: i64,
    pub text: String,
    pub regions: Vec<Vec<[f64; 2]>>,
}

#[derive(Deserialize, Debug)]
pub struct PageCallback {
    pub page_number: i32,
    pub width: f64,
    pub height: f64,
    pub text: String,
    pub sentences: Vec<SentencePayload>,
    pub percent: i16,
}

#[derive(Deserialize, Debug)]
pub struct ProgressCallback {
    pub percent: i16,
}

#[derive(Deserialize, Debug)]
pub struct CompletedCallback {
    pub result_ref: String,
    /// Extraction completions carry the concatenated, speech-cleaned
    /// document text; conversions carry only the artifact reference.
    pub document_text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct FailedCallback {
    pub error: String,
}

//=========================================================================================
// Billing Provider Webhook Payloads
//=========================================================================================

/// One billing-provider event delivery. `id` is the provider's unique
/// delivery id; redeliveries reuse it.
#[derive(Deserialize, Debug, Clone)]
pub struct BillingEventPayload {
    pub id: String,
    pub kind: String,
    pub user_id: Uuid,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub tier: Option<String>,
}
