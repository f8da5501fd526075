//! services/api/src/web/callbacks.rs
//!
//! Progress callback routes for the compute pool. Delivery is
//! at-least-once; every route is idempotent because the tracker absorbs
//! duplicate or late messages for jobs already in a terminal state.

use crate::assembler::{PageResult, SentenceResult};
use crate::web::protocol::{CompletedCallback, FailedCallback, PageCallback, ProgressCallback};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use lectern_core::ports::PortError;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

fn callback_error_response(e: PortError) -> (StatusCode, String) {
    match e {
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        other => {
            error!("Worker callback failed: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

/// One extracted page with its sentences.
pub async fn page_callback_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<PageCallback>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result = PageResult {
        page_number: payload.page_number,
        width: payload.width,
        height: payload.height,
        text: payload.text,
        sentences: payload
            .sentences
            .into_iter()
            .map(|s| SentenceResult {
                sequence: s.sequence,
                text: s.text,
                regions: s.regions,
            })
            .collect(),
        percent: payload.percent,
    };
    app_state
        .assembler
        .on_page(job_id, result)
        .await
        .map_err(callback_error_response)?;
    Ok(StatusCode::OK)
}

/// A bare progress update with no page payload.
pub async fn progress_callback_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<ProgressCallback>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    app_state
        .assembler
        .on_progress(job_id, payload.percent)
        .await
        .map_err(callback_error_response)?;
    Ok(StatusCode::OK)
}

/// The worker's final success callback.
pub async fn completed_callback_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<CompletedCallback>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    app_state
        .assembler
        .on_completed(job_id, &payload.result_ref, payload.document_text.as_deref())
        .await
        .map_err(callback_error_response)?;
    Ok(StatusCode::OK)
}

/// The worker's final failure callback. The detail is surfaced verbatim to
/// the user; recovery is a fresh submission, never an in-place retry.
pub async fn failed_callback_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<FailedCallback>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    app_state
        .assembler
        .on_failed(job_id, &payload.error)
        .await
        .map_err(callback_error_response)?;
    Ok(StatusCode::OK)
}
