//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::gateway::SubmitError;
use crate::web::protocol::{
    JobView, PageView, PositionUpdateRequest, PositionView, SentenceView, SubmitJobRequest,
    SubmitJobResponse, UploadDocumentResponse, UsageView,
};
use crate::web::state::AppState;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use bytes::Bytes;
use lectern_core::domain::{Job, JobKind, JobStatus};
use lectern_core::ports::PortError;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::OpenApi;
use uuid::Uuid;

/// Every admitted job charges one quota unit.
const UNITS_PER_JOB: i64 = 1;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        upload_document_handler,
        submit_job_handler,
        get_job_handler,
        get_usage_handler,
    ),
    components(
        schemas(
            UploadDocumentResponse,
            SubmitJobRequest,
            SubmitJobResponse,
            JobView,
            UsageView,
            crate::web::protocol::JobKindView,
            crate::web::protocol::JobStatusView,
        )
    ),
    tags(
        (name = "Lectern API", description = "API endpoints for the document-to-audio pipeline.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Shared Extraction and Error Mapping Helpers
//=========================================================================================

/// Pulls the authenticated caller id from the `x-user-id` header. Identity
/// itself is established upstream; handlers only consume the forwarded id.
fn require_user_id(headers: &HeaderMap) -> Result<Uuid, (StatusCode, String)> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                "x-user-id header is required".to_string(),
            )
        })?;
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "Invalid x-user-id format".to_string(),
        )
    })
}

fn port_error_response(e: PortError) -> (StatusCode, String) {
    match e {
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        PortError::QuotaExceeded => (StatusCode::TOO_MANY_REQUESTS, e.to_string()),
        PortError::Unauthorized => (StatusCode::FORBIDDEN, e.to_string()),
        PortError::Unexpected(msg) => {
            error!("Unexpected port error: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn submit_error_response(e: SubmitError) -> (StatusCode, String) {
    match e {
        SubmitError::Forbidden => (StatusCode::FORBIDDEN, e.to_string()),
        SubmitError::AlreadyInProgress => (StatusCode::CONFLICT, e.to_string()),
        SubmitError::QuotaExceeded => (StatusCode::TOO_MANY_REQUESTS, e.to_string()),
        SubmitError::WorkerUnavailable(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
        SubmitError::Port(inner) => port_error_response(inner),
    }
}

/// Confirms the caller owns the document before serving its contents.
async fn require_owned_document(
    app_state: &AppState,
    user_id: Uuid,
    document_id: Uuid,
) -> Result<(), (StatusCode, String)> {
    let document = app_state
        .db
        .get_document_by_id(document_id)
        .await
        .map_err(port_error_response)?;
    if document.user_id != user_id {
        return Err((
            StatusCode::FORBIDDEN,
            "Document does not belong to this user".to_string(),
        ));
    }
    Ok(())
}

/// Builds the poll-safe job view, attaching a signed artifact URL for
/// finished conversions. URL issuance is best-effort; a storage hiccup
/// never hides the job state itself.
async fn job_view(app_state: &AppState, job: Job) -> JobView {
    let artifact_url = match (&job.kind, &job.status, &job.result_ref) {
        (JobKind::Conversion, JobStatus::Completed, Some(result_ref)) => {
            match app_state
                .blobs
                .signed_url(result_ref, app_state.config.signed_url_ttl_secs)
                .await
            {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Could not sign artifact URL for job {}: {}", job.id, e);
                    None
                }
            }
        }
        _ => None,
    };
    JobView::from_job(job, artifact_url)
}

//=========================================================================================
// Document Upload
//=========================================================================================

/// Upload a document for processing.
///
/// Accepts a multipart/form-data request with a single file part. The raw
/// upload lands in blob storage; extraction is a separate job submission.
#[utoipa::path(
    post,
    path = "/documents",
    request_body(content_type = "multipart/form-data", description = "The document to upload."),
    responses(
        (status = 201, description = "Document created successfully", body = UploadDocumentResponse),
        (status = 400, description = "Bad request (e.g., missing header or file)"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn upload_document_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;

    let (file_name, data): (String, Bytes) =
        if let Some(field) = multipart.next_field().await.map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read multipart data: {}", e),
            )
        })? {
            let name = field.file_name().unwrap_or("untitled.pdf").to_string();
            let data = field.bytes().await.map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to read file bytes: {}", e),
                )
            })?;
            (name, data)
        } else {
            return Err((
                StatusCode::BAD_REQUEST,
                "Multipart form must include a file".to_string(),
            ));
        };

    app_state
        .db
        .get_or_create_user(user_id)
        .await
        .map_err(port_error_response)?;

    let storage_path = format!("uploads/{}/{}_{}", user_id, Uuid::new_v4(), file_name);
    app_state
        .blobs
        .store(&storage_path, data.to_vec(), "application/pdf")
        .await
        .map_err(port_error_response)?;

    let document = app_state
        .db
        .create_document(user_id, &file_name, &storage_path)
        .await
        .map_err(port_error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(UploadDocumentResponse {
            document_id: document.id,
        }),
    ))
}

//=========================================================================================
// Job Submission and Status
//=========================================================================================

/// Submit an extraction or conversion job for a document.
#[utoipa::path(
    post,
    path = "/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 202, description = "Job admitted and dispatched", body = SubmitJobResponse),
        (status = 403, description = "Caller does not own the document"),
        (status = 409, description = "An extraction is already in progress"),
        (status = 429, description = "Usage limit reached"),
        (status = 502, description = "Worker pool unavailable")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn submit_job_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;

    let job_id = app_state
        .gateway
        .submit(
            user_id,
            request.document_id,
            request.kind.into(),
            UNITS_PER_JOB,
        )
        .await
        .map_err(submit_error_response)?;

    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

/// Fetch one job's state. Read-only and safe to poll at will.
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    responses(
        (status = 200, description = "Current job state", body = JobView),
        (status = 403, description = "Caller does not own the job's document"),
        (status = 404, description = "Unknown job id")
    ),
    params(
        ("job_id" = Uuid, Path, description = "The job to inspect."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn get_job_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    let job = app_state
        .tracker
        .get_by_id(job_id)
        .await
        .map_err(port_error_response)?;
    require_owned_document(&app_state, user_id, job.document_id).await?;
    Ok(Json(job_view(&app_state, job).await))
}

/// Long-poll variant of the job view, backed by the single-flight poll
/// registry: concurrent viewers of one job share a single loop against the
/// tracker. Responds with the next state the loop observes; the nudge
/// covers viewers returning to the foreground between ticks.
pub async fn wait_job_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    let job = app_state
        .tracker
        .get_by_id(job_id)
        .await
        .map_err(port_error_response)?;
    require_owned_document(&app_state, user_id, job.document_id).await?;

    let mut rx = app_state.polls.start(job_id);
    app_state.polls.nudge(job_id);

    let observed = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let current = rx.borrow().clone();
            if let Some(job) = current {
                return Some(job);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await
    .ok()
    .flatten()
    // The loop never observed the job in time; fall back to the direct read.
    .unwrap_or(job);

    Ok(Json(job_view(&app_state, observed).await))
}

#[derive(Deserialize)]
pub struct LatestJobQuery {
    pub kind: crate::web::protocol::JobKindView,
}

/// Most recent job of a kind for a document; conversions keep a history and
/// only the newest row is authoritative for display.
pub async fn get_latest_job_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
    Query(query): Query<LatestJobQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    require_owned_document(&app_state, user_id, document_id).await?;

    let kind: JobKind = query.kind.into();
    let job = app_state
        .tracker
        .get_latest(document_id, kind)
        .await
        .map_err(port_error_response)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("No {} job for this document", kind.as_str()),
            )
        })?;
    Ok(Json(job_view(&app_state, job).await))
}

/// Current usage window for the caller.
#[utoipa::path(
    get,
    path = "/usage",
    responses(
        (status = 200, description = "The caller's usage for the current period", body = UsageView)
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn get_usage_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    let user = app_state
        .db
        .get_user(user_id)
        .await
        .map_err(port_error_response)?;
    let usage = app_state
        .ledger
        .get_or_create_usage(&user)
        .await
        .map_err(port_error_response)?;
    Ok(Json(UsageView::from(usage)))
}

//=========================================================================================
// Progressive Document Views
//=========================================================================================

/// Pages stored so far. During extraction this is the committed prefix;
/// clients gate rendering on the job view's `partial_available` flag.
pub async fn list_pages_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    require_owned_document(&app_state, user_id, document_id).await?;

    let pages = app_state
        .db
        .list_pages(document_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(
        pages.into_iter().map(PageView::from).collect::<Vec<_>>(),
    ))
}

/// Sentences stored so far, in reading order.
pub async fn list_sentences_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    require_owned_document(&app_state, user_id, document_id).await?;

    let sentences = app_state
        .db
        .list_sentences(document_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(
        sentences
            .into_iter()
            .map(SentenceView::from)
            .collect::<Vec<_>>(),
    ))
}

/// On-demand audio for one sentence, for scrubbable playback. The browser
/// fetches (and prefetches) sentence audio by sequence number; synthesis
/// happens lazily per sentence.
pub async fn sentence_audio_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((document_id, sequence)): Path<(Uuid, i64)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    require_owned_document(&app_state, user_id, document_id).await?;

    let sentence = app_state
        .db
        .get_sentence(document_id, sequence)
        .await
        .map_err(port_error_response)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("No sentence {} for this document", sequence),
            )
        })?;

    let audio = app_state
        .synth
        .synthesize(&sentence.text)
        .await
        .map_err(port_error_response)?;

    Ok(([("content-type", "audio/mpeg")], audio))
}

//=========================================================================================
// Playback Position
//=========================================================================================

pub async fn get_position_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    require_owned_document(&app_state, user_id, document_id).await?;

    let sentence_index = app_state
        .db
        .get_playback_position(document_id)
        .await
        .map_err(port_error_response)?
        .map(|p| p.sentence_index)
        .unwrap_or(0);
    Ok(Json(PositionView { sentence_index }))
}

/// Overwrites the advisory resume position. The client debounces its
/// writes; a lost update never affects playback correctness.
pub async fn update_position_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(document_id): Path<Uuid>,
    Json(request): Json<PositionUpdateRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = require_user_id(&headers)?;
    require_owned_document(&app_state, user_id, document_id).await?;

    app_state
        .db
        .upsert_playback_position(document_id, request.sentence_index)
        .await
        .map_err(port_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
