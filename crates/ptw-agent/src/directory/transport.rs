//! HTTP transport for directory calls

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Status and body of a directory response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs directory requests
///
/// An `Err` means no response was received at all; any HTTP status, including
/// errors, comes back as `Ok`.
#[async_trait]
pub trait DirectoryTransport: Send + Sync {
    /// GET `path` with `query` as URL parameters
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<HttpResponse>;

    /// POST `form` url-encoded to `path`
    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<HttpResponse>;
}

/// [`DirectoryTransport`] over `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    host: String,
}

impl HttpTransport {
    /// Create a transport for the directory at `host` (e.g. `https://directory.example.com`)
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ptw-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            host: host.into(),
        })
    }

    /// Absolute URL of a directory endpoint
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.host.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn finish(response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("Failed to read directory response body")?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl DirectoryTransport for HttpTransport {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<HttpResponse> {
        let url = self.url_for(path);
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        Self::finish(response).await
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<HttpResponse> {
        let url = self.url_for(path);
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        Self::finish(response).await
    }
}
