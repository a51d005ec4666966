//! One-shot upload of a captured utterance

use async_trait::async_trait;
use url::Url;

use crate::{Error, Result};

/// Fallback reason when the endpoint gives none
const GENERIC_FAILURE: &str = "Upload failed";

/// Error body returned by the upload endpoint
#[derive(serde::Deserialize)]
struct UploadErrorResponse {
    error: Option<String>,
}

/// Delivers a finished utterance to the peer
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload WAV bytes tagged with the session id
    ///
    /// # Errors
    ///
    /// Returns [`Error::UploadFailed`] if the request fails or is rejected
    async fn upload(&self, wav: Vec<u8>, session_id: &str) -> Result<()>;
}

/// Multipart upload to the server's `/upload_audio` endpoint
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    url: Url,
}

impl HttpUploader {
    /// Create an uploader posting to `url`
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, wav: Vec<u8>, session_id: &str) -> Result<()> {
        tracing::debug!(audio_bytes = wav.len(), session_id, "uploading utterance");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| upload_failed(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("session_id", session_id.to_string());

        let response = self
            .client
            .post(self.url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "upload request failed");
                upload_failed(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<UploadErrorResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            tracing::warn!(status = %status, reason = %reason, "upload rejected");
            return Err(upload_failed(reason));
        }

        tracing::info!(status = %status, "utterance uploaded");
        Ok(())
    }
}

fn upload_failed(reason: String) -> Error {
    Error::UploadFailed { reason }
}
