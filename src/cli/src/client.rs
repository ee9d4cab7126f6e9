//! HTTP client for communicating with the Transmute API server.

use std::path::Path;

use anyhow::{Context, Result};
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// API response wrapper matching the server's ApiResponse format.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[allow(dead_code)]
    pub error_code: Option<String>,
}

/// Error body returned by the server for non-2xx responses.
#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_code: Option<String>,
}

#[derive(Debug, Error)]
#[error("API error ({status}): {message}")]
pub struct ApiError {
    pub status: reqwest::StatusCode,
    pub message: String,
    pub code: Option<String>,
}

/// A downloaded file.
pub struct Download {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

/// HTTP client for the Transmute API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Perform a GET request and deserialize the response data.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        unwrap_data(check(resp).await?, &url).await
    }

    /// Upload files as a multipart form under `field`.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        field: &str,
        files: &[&Path],
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut form = multipart::Form::new();
        for file in files {
            let bytes = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            form = form.part(field.to_string(), multipart::Part::bytes(bytes).file_name(name));
        }

        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .query(query)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        unwrap_data(check(resp).await?, &url).await
    }

    /// Download a binary body along with the filename the server suggests.
    pub async fn download(&self, path: &str) -> Result<Download> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let resp = check(resp).await?;

        let filename = resp
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_filename);
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read body from {}", url))?;

        Ok(Download {
            filename,
            bytes: bytes.to_vec(),
        })
    }

    /// Perform a raw GET request and return the full JSON value (for health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        // An unhealthy server still answers with a JSON body worth showing.
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let (message, code) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => (parsed.error, parsed.error_code),
        Err(_) => (body, None),
    };
    Err(ApiError {
        status,
        message,
        code,
    }
    .into())
}

async fn unwrap_data<T: DeserializeOwned>(resp: Response, url: &str) -> Result<T> {
    let api_resp: ApiResponse<T> = resp
        .json()
        .await
        .with_context(|| format!("Failed to parse response from {}", url))?;

    if api_resp.success {
        api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
    } else {
        Err(anyhow::anyhow!(
            "API error: {}",
            api_resp.error.unwrap_or_else(|| "Unknown error".into())
        ))
    }
}

fn attachment_filename(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}
