//! HTTP client for REST and GraphQL sources
//!
//! Every failure is classified into a [`FetchError`] so the retry layer can tell
//! transient trouble (timeouts, 5xx, 429) from requests that will never succeed.

use crate::error::{FetchError, IngestError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Longest response excerpt carried in an error message
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL every relative path is resolved against
    pub base_url: String,
    /// Bearer token
    pub token: Option<String>,
    /// Extra request headers
    pub headers: HashMap<String, String>,
    /// Transport timeout (seconds)
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            headers: HashMap::new(),
            timeout_secs: 30,
            user_agent: format!("polarway-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Thin reqwest wrapper returning JSON bodies.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    client: Client,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| IngestError::Config(format!("invalid base url {:?}: {}", config.base_url, e)))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| IngestError::Config(format!("invalid token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| IngestError::Config(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| IngestError::Config(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` against the base URL. Absolute URLs are used as given.
    pub fn endpoint(&self, path: &str) -> std::result::Result<Url, FetchError> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| FetchError::Permanent(format!("invalid path {:?}: {}", path, e)))
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> std::result::Result<Value, FetchError> {
        let url = self.endpoint(path)?;
        debug!(url = %url, params = query.len(), "GET");
        self.send(self.client.get(url).query(query)).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> std::result::Result<Value, FetchError> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "POST");
        self.send(self.client.post(url).json(body)).await
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Value, FetchError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(|e| classify_transport(&e))?;

        if let Some(err) = classify_status(status, retry_after, &body) {
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| {
            FetchError::Protocol(format!("response is not valid JSON: {} ({})", e, excerpt(&body)))
        })
    }
}

/// Map a non-success status to a fetch error; `None` for 2xx.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let message = format!("HTTP {} - {}", status, excerpt(body));

    Some(if status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    })
}

fn classify_transport(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else if err.is_decode() {
        FetchError::Protocol(err.to_string())
    } else if err.is_builder() {
        FetchError::Permanent(err.to_string())
    } else {
        FetchError::Transient(err.to_string())
    }
}

/// `Retry-After` in delay-seconds form.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
