//! Client for the external file-hosting helper that turns data URIs into
//! public URLs.

use std::time::Duration;

use arenabridge_core::{Error, FileBedConfig, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileBedClient {
    client: Client,
    upload_url: String,
    api_key: Option<String>,
}

impl FileBedClient {
    pub fn new(upload_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            upload_url: upload_url.into(),
            api_key,
        })
    }

    /// `None` when the helper is switched off or has no URL.
    pub fn from_config(config: &FileBedConfig) -> Result<Option<Self>> {
        match config.active_upload_url() {
            Some(url) => Ok(Some(Self::new(url, config.api_key.clone())?)),
            None => Ok(None),
        }
    }

    /// Where an uploaded file is served: the upload URL's parent plus
    /// `/uploads/<filename>`.
    pub fn public_url(&self, filename: &str) -> String {
        let base = self.upload_url.trim_end_matches('/');
        let parent = match base.rfind('/') {
            Some(idx) if !base[..idx].ends_with('/') => &base[..idx],
            _ => base,
        };
        format!("{}/uploads/{}", parent, filename)
    }

    /// Upload one data URI and return its public URL.
    pub async fn upload(&self, file_name: &str, data_uri: &str) -> Result<String> {
        debug!("Uploading {} ({} bytes) to file bed", file_name, data_uri.len());
        let body = json!({
            "file_name": file_name,
            "file_data": data_uri,
            "api_key": self.api_key,
        });

        let response = self
            .client
            .post(&self.upload_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Translation(format!("file bed upload failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Translation(format!(
                "file bed returned {}: {}",
                status, text
            )));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| Error::Translation(format!("file bed response: {}", e)))?;

        match (parsed.success, parsed.filename) {
            (true, Some(filename)) => {
                let url = self.public_url(&filename);
                info!("Uploaded {} to {}", file_name, url);
                Ok(url)
            }
            (_, _) => Err(Error::Translation(format!(
                "file bed rejected upload: {}",
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }
}
