use std::time::Duration;

use anyhow::Result;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::debug;

use super::sse::GeminiSseParser;
use crate::config::GeminiProviderConfig;
use crate::credentials::{Credential, CredentialProbe, Health};
use crate::providers::{
    ChatRole, ProviderClient, ProviderError, ProviderErrorKind, ProviderKind, ProviderRequest,
    ProviderResult, ProviderStream, USER_AGENT, classify_reqwest_error, http_client,
    resolve_base_url,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Upper bound on a whole key probe, response body included.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Gemini API configuration. Keys come from the credential pool per request.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
}

impl GeminiConfig {
    /// Resolves the base URL.
    ///
    /// Environment variables:
    /// - `GEMINI_BASE_URL` (optional, overrides config)
    ///
    /// # Errors
    /// Returns an error if the resolved URL is malformed.
    pub fn from_config(config: &GeminiProviderConfig) -> Result<Self> {
        let base_url = resolve_base_url(
            config.base_url.as_deref(),
            "GEMINI_BASE_URL",
            DEFAULT_BASE_URL,
            "Gemini",
        )?;
        Ok(Self { base_url })
    }
}

/// Gemini client.
pub struct GeminiClient {
    config: GeminiConfig,
    http: reqwest::Client,
}

impl GeminiClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        Ok(Self {
            config,
            http: http_client()?,
        })
    }

    /// Opens a `streamGenerateContent` SSE stream.
    ///
    /// # Errors
    /// Returns a classified error if no key is selected, the request fails,
    /// or the API answers with a non-success status.
    pub async fn send_messages_stream(&self, request: &ProviderRequest) -> ProviderResult<ProviderStream> {
        let credential = request.credential.as_ref().ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::Auth, "No Gemini API key selected")
        })?;

        let body = build_gemini_request(request);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url,
            model_path(&request.model)
        );
        debug!(session = %request.session, model = %request.model, credential = credential.id(), "gemini request");

        let response = self
            .http
            .post(&url)
            .headers(build_headers(credential.secret()))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &error_body));
        }

        Ok(Box::pin(GeminiSseParser::new(response.bytes_stream())))
    }

    /// Lists models with the given key to learn whether it works.
    pub async fn check_key(&self, api_key: &str) -> Health {
        let url = format!("{}/models?pageSize=1", self.config.base_url);
        let mut headers = build_headers(api_key);
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let request = self.http.get(&url).headers(headers).timeout(PROBE_TIMEOUT);
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("gemini key probe failed: {err}");
                return Health::Suspect;
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Health::Healthy;
        }
        let body = response.text().await.unwrap_or_default();
        match ProviderError::http_status(status, &body).kind {
            // An invalid key is reported as 400 API_KEY_INVALID
            ProviderErrorKind::Auth => Health::Invalid,
            ProviderErrorKind::InvalidRequest if body.contains("API_KEY_INVALID") => Health::Invalid,
            _ => Health::Suspect,
        }
    }
}

impl ProviderClient for GeminiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn send<'a>(&'a self, request: &'a ProviderRequest) -> BoxFuture<'a, ProviderResult<ProviderStream>> {
        Box::pin(self.send_messages_stream(request))
    }
}

impl CredentialProbe for GeminiClient {
    fn probe<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Health> {
        Box::pin(self.check_key(credential.secret()))
    }
}

/// Accepts both `gemini-2.5-flash` and `models/gemini-2.5-flash`.
fn model_path(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

fn build_gemini_request(request: &ProviderRequest) -> Value {
    let contents: Vec<Value> = request
        .messages()
        .into_iter()
        .filter(|m| !m.text.is_empty())
        .map(|m| {
            let role = match m.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            };
            json!({ "role": role, "parts": [{ "text": m.text }] })
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": { "temperature": request.temperature },
    });
    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

fn build_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-goog-api-key",
        HeaderValue::from_str(api_key).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    headers
}
