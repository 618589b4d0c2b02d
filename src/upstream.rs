use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tracing::debug;

use crate::error::ProxyError;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://cdn.contentful.com";

/// Credentials for one upstream space, read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCredential {
    pub space_id: String,
    pub access_token: String,
}

/// The upstream content API, bound to a single space.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// `resource_path` is relative to the space, e.g. `entries/abc`.
    async fn fetch(&self, resource_path: &str, query: &[(String, String)]) -> Result<Value, ProxyError>;

    async fn ping(&self) -> Result<(), ProxyError>;
}

pub struct ContentfulClient {
    http_client: reqwest::Client,
    space_url: String,
}

impl ContentfulClient {
    pub fn new(base_url: &str, credential: &UpstreamCredential, timeout: Duration) -> Result<Self> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http_client,
            space_url: format!(
                "{}/spaces/{}",
                base_url.trim_end_matches('/'),
                credential.space_id
            ),
        })
    }

    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<reqwest::Response, ProxyError> {
        let resp = self
            .http_client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| ProxyError::Connection(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        // Error bodies look like {"sys": {"type": "Error", ...}, "message": "..."}.
        let message = resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Upstream error").to_string());

        Err(ProxyError::Upstream {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Upstream for ContentfulClient {
    async fn fetch(&self, resource_path: &str, query: &[(String, String)]) -> Result<Value, ProxyError> {
        let url = format!("{}/{}", self.space_url, resource_path.trim_start_matches('/'));
        debug!(%url, "fetching from upstream");

        let resp = self.get(&url, query).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| ProxyError::Connection(format!("invalid upstream body: {e}")))
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        self.get(&self.space_url, &[]).await.map(|_| ())
    }
}
