//! services/api/src/adapters/worker.rs
//!
//! This module contains the adapter for the external compute pool. It
//! implements the `WorkerPool` port by posting job submissions to the pool's
//! HTTP surface; extraction and conversion progress flows back through the
//! callback routes in `web::callbacks`.

use async_trait::async_trait;
use lectern_core::domain::Document;
use lectern_core::ports::{PortError, PortResult, WorkerPool};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `WorkerPool` port against the compute
/// pool's HTTP submission endpoints.
#[derive(Clone)]
pub struct HttpWorkerAdapter {
    client: reqwest::Client,
    base_url: String,
}

/// The pool acknowledges a submission with its own task handle.
#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

impl HttpWorkerAdapter {
    /// Creates a new `HttpWorkerAdapter`.
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    async fn submit(&self, endpoint: &str, document: &Document, job_id: Uuid) -> PortResult<String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "file_id": document.id, "job_id": job_id }))
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .error_for_status()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        info!(
            "Dispatched {} task {} for document {}",
            endpoint, body.id, document.id
        );
        Ok(body.id)
    }
}

//=========================================================================================
// `WorkerPool` Trait Implementation
//=========================================================================================

#[async_trait]
impl WorkerPool for HttpWorkerAdapter {
    async fn submit_extraction(&self, document: &Document, job_id: Uuid) -> PortResult<String> {
        self.submit("parse", document, job_id).await
    }

    async fn submit_conversion(&self, document: &Document, job_id: Uuid) -> PortResult<String> {
        self.submit("convert", document, job_id).await
    }
}
