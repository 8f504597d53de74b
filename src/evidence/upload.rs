//! Evidence upload.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::EvidenceBlob;
use crate::error::NetworkError;

#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Upload a finished clip and return a URL where it can be fetched.
    async fn upload(&self, blob: &EvidenceBlob) -> Result<String, NetworkError>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    url: Option<String>,
}

/// Multipart `POST` with the clip in the `video` field.
pub struct HttpUploader {
    http: reqwest::Client,
    url: String,
}

impl HttpUploader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url: url.into() })
    }
}

/// Stand-in when no upload endpoint is configured. Every upload fails, so
/// clips stay retrievable through `take_unsent_clip`.
#[derive(Debug, Default)]
pub struct UnconfiguredUploader;

#[async_trait]
impl MediaUploader for UnconfiguredUploader {
    async fn upload(&self, _blob: &EvidenceBlob) -> Result<String, NetworkError> {
        Err(NetworkError::Request("no upload endpoint configured".into()))
    }
}

pub fn parse_upload_response(body: &str) -> Result<String, NetworkError> {
    let resp: UploadResponse =
        serde_json::from_str(body).map_err(|e| NetworkError::Decode(e.to_string()))?;
    if resp.success == Some(false) {
        return Err(NetworkError::Request(resp.message.unwrap_or_default()));
    }
    resp.url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| NetworkError::Decode("upload reply has no url".into()))
}

#[async_trait]
impl MediaUploader for HttpUploader {
    async fn upload(&self, blob: &EvidenceBlob) -> Result<String, NetworkError> {
        let part = reqwest::multipart::Part::bytes(blob.data.clone())
            .file_name(blob.file_name.clone())
            .mime_str(&blob.content_type)?;
        let form = reqwest::multipart::Form::new().part("video", part);

        let resp = self.http.post(&self.url).multipart(form).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let url = parse_upload_response(&body)?;
        info!(bytes = blob.data.len(), url = %url, "evidence_uploaded");
        Ok(url)
    }
}
