//! Authenticated HTTP client for the ShopChat support API
//!
//! Wraps reqwest::Client with bearer-token injection and uniform status
//! checking. Token issuance happens elsewhere; this client only replays the
//! stored credential.

use anyhow::{bail, Context, Result};

use crate::config::Config;

/// Authenticated client for the support-chat REST endpoints.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Build a client from stored credentials.
    pub fn new(config: &Config) -> Result<Self> {
        let token = config
            .api_token
            .clone()
            .context("No API token. Run 'shopchat-cli login' first.")?;

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.base_url(),
            token,
        })
    }

    /// GET request relative to the API base URL.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        check_response(resp, &url).await
    }

    /// POST request with a JSON body.
    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, &url).await
    }

    /// PUT request with an empty body.
    pub async fn put(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("PUT {}", url);

        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("PUT {} failed", url))?;

        check_response(resp, &url).await
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- run 'shopchat-cli login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
