use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use shared::protocol::AttachmentRef;
use tokio::sync::mpsc;

/// Pushes attachment bytes to whatever storage backs the deployment and
/// returns the stable reference to embed in the message. Progress is
/// reported in whole percent over the channel; implementations may skip
/// intermediate values but must end at 100 on success.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        progress: mpsc::Sender<u8>,
    ) -> Result<AttachmentRef>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Default uploader: a single POST of the raw bytes to the configured
/// upload endpoint, which responds with the public URL.
pub struct HttpAttachmentUploader {
    http: Client,
    upload_url: String,
}

impl HttpAttachmentUploader {
    pub fn new(upload_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            upload_url: upload_url.into(),
        }
    }
}

#[async_trait]
impl AttachmentUploader for HttpAttachmentUploader {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        progress: mpsc::Sender<u8>,
    ) -> Result<AttachmentRef> {
        let _ = progress.send(0).await;
        let response = self
            .http
            .post(&self.upload_url)
            .query(&[("filename", filename)])
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("attachment upload to {} failed", self.upload_url))?
            .error_for_status()
            .context("upload service rejected the attachment")?;
        let body: UploadResponse = response
            .json()
            .await
            .context("upload service returned an invalid response")?;
        let _ = progress.send(100).await;
        Ok(AttachmentRef {
            url: body.url,
            filename: filename.to_owned(),
        })
    }
}
