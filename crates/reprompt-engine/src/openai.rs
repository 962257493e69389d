use std::env;
use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::ServiceError;

pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Long-lived handle to an OpenAI-compatible API.
///
/// Cloning is cheap: clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        api_base: &str,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ServiceError> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|source| ServiceError::from_reqwest("http client", source))?;
        Ok(Self {
            http,
            api_base: normalize_api_base(api_base),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    /// Reads `OPENAI_API_BASE`/`OPENAI_BASE_URL` and `OPENAI_API_KEY`/`OPENAI_API_KEY_BACKUP`.
    pub fn from_env(timeout: Option<Duration>) -> Result<Self, ServiceError> {
        let api_base = first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
            .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string());
        let api_key = first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]);
        Self::new(&api_base, api_key, timeout)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    pub fn post_json(&self, path: &str, payload: &Value) -> Result<Value, ServiceError> {
        let endpoint = self.endpoint(path);
        let api_key = self.api_key.as_deref().ok_or(ServiceError::MissingApiKey)?;
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .map_err(|source| ServiceError::from_reqwest(&endpoint, source))?;
        response_json_or_error(&endpoint, response)
    }

    /// Downloads a provider-hosted asset, returning its bytes and content type.
    pub fn get_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ServiceError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|source| ServiceError::from_reqwest(url, source))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::Status {
                endpoint: url.to_string(),
                code: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|source| ServiceError::from_reqwest(url, source))?
            .to_vec();
        Ok((bytes, mime_type))
    }
}

fn response_json_or_error(endpoint: &str, response: HttpResponse) -> Result<Value, ServiceError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|source| ServiceError::from_reqwest(endpoint, source))?;
    if !status.is_success() {
        return Err(ServiceError::Status {
            endpoint: endpoint.to_string(),
            code: status.as_u16(),
            body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
        });
    }
    serde_json::from_str(&body)
        .map_err(|err| ServiceError::malformed(endpoint, format!("invalid JSON payload ({err})")))
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Trims trailing slashes and appends `/v1` to a bare host.
pub fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_OPENAI_API_BASE.to_string();
    }
    let mut base = trimmed.trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
