//! services/api/src/adapters/blobstore.rs
//!
//! This module contains the adapter for the blob storage service. It
//! implements the `BlobStore` port: raw uploads and finished audio artifacts
//! live there, and clients reach them through short-lived signed URLs.

use async_trait::async_trait;
use lectern_core::ports::{BlobStore, PortError, PortResult};
use serde::Deserialize;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `BlobStore` port against the storage
/// service's HTTP API.
#[derive(Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    service_key: Option<String>,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl HttpBlobStore {
    /// Creates a new `HttpBlobStore`.
    pub fn new(client: reqwest::Client, base_url: String, service_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            service_key,
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.service_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

//=========================================================================================
// `BlobStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn store(&self, path: &str, data: Vec<u8>, content_type: &str) -> PortResult<()> {
        let url = format!("{}/object/{}", self.base_url.trim_end_matches('/'), path);
        self.request(reqwest::Method::POST, url)
            .header("content-type", content_type.to_string())
            .body(data)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .error_for_status()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }

    async fn signed_url(&self, path: &str, ttl_secs: u64) -> PortResult<String> {
        let url = format!(
            "{}/object/sign/{}",
            self.base_url.trim_end_matches('/'),
            path
        );
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&serde_json::json!({ "expiresIn": ttl_secs }))
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .error_for_status()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(body.signed_url)
    }
}
