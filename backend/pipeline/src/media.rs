//! Content-addressed media gateway client.
//!
//! The pipeline never looks inside the media store — it only uploads a blob
//! with metadata and keeps the returned content hash as evidence. The
//! gateway contract is the multipart upload below; everything else about
//! the store is someone else's problem.

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    pub content_hash: String,
    pub gateway_url: String,
    pub size: u64,
}

pub struct MediaUpload {
    pub file_name: String,
    pub file_type: String,
    pub project_id: String,
    pub bytes: Vec<u8>,
    pub metadata: Value,
}

/// Port over the media store's upload contract.
#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    async fn upload(&self, upload: MediaUpload) -> Result<MediaRef>;
}

pub struct HttpMediaGateway {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    ipfs_hash: Option<String>,
    gateway_url: Option<String>,
    size: Option<u64>,
    error: Option<String>,
}

impl HttpMediaGateway {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MediaStore for HttpMediaGateway {
    async fn upload(&self, upload: MediaUpload) -> Result<MediaRef> {
        let size = upload.bytes.len() as u64;
        let form = multipart::Form::new()
            .part(
                "file",
                multipart::Part::bytes(upload.bytes).file_name(upload.file_name),
            )
            .text("file_type", upload.file_type)
            .text("project_id", upload.project_id)
            .text("metadata", upload.metadata.to_string());

        let response: UploadResponse = self
            .client
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if response.status != "success" {
            return Err(PipelineError::Validation(format!(
                "media gateway rejected upload: {}",
                response.error.unwrap_or_else(|| response.status.clone())
            )));
        }
        let content_hash = response.ipfs_hash.ok_or_else(|| {
            PipelineError::Validation("media gateway returned no content hash".to_string())
        })?;

        Ok(MediaRef {
            gateway_url: response
                .gateway_url
                .unwrap_or_else(|| format!("{}/{}", self.base_url, content_hash)),
            content_hash,
            size: response.size.unwrap_or(size),
        })
    }
}
