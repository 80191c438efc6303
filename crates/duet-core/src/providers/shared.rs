//! Provider-agnostic types shared across LLM backends.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for duet API requests.
pub const USER_AGENT: &str = concat!("duet/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Config resolution helpers
// ============================================================================

/// Upper bound on establishing a provider connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client shared by the providers' requests.
///
/// Only the connect phase is bounded here. Waiting on a response is bounded
/// by the generation worker so a stop can interrupt it.
///
/// # Errors
/// Returns an error if the TLS backend fails to initialize.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Reads an API key from the environment, ignoring blank values.
pub fn env_api_key(env_var: &str) -> Option<String> {
    let key = std::env::var(env_var).ok()?;
    let trimmed = key.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Resolves a base URL with precedence: env > config > default.
///
/// # Arguments
/// * `config_base_url` - Value from config file (if present)
/// * `env_var` - Environment variable name (e.g., "`GEMINI_BASE_URL`")
/// * `default_url` - Default URL if neither env nor config is set
/// * `provider_name` - Human-readable provider name for error messages
///
/// # Errors
/// Returns an error if the resolved URL is not well-formed.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    provider_name: &str,
) -> Result<String> {
    if let Ok(env_url) = std::env::var(env_var) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    if let Some(config_url) = config_base_url {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str, provider_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {provider_name} base URL: {url}"))?;
    Ok(())
}

/// Speaker of a provider-bound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

/// A message as sent to a provider. UI-only annotations never become one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            text: text.into(),
        }
    }
}

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Connection timeout, request timeout or a stalled stream
    Timeout,
    /// HTTP 5xx or a refused/reset connection
    Unavailable,
    /// Quota or rate limit on the credential in use
    RateLimited,
    /// Credential rejected or missing
    Auth,
    /// Request the provider will never accept (bad model, malformed body)
    InvalidRequest,
    /// Failed to parse response (JSON parse error, invalid SSE, etc.)
    Parse,
    /// API-level error without a more specific category
    Api,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Unavailable => write!(f, "unavailable"),
            ProviderErrorKind::RateLimited => write!(f, "rate_limited"),
            ProviderErrorKind::Auth => write!(f, "auth"),
            ProviderErrorKind::InvalidRequest => write!(f, "invalid_request"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::Api => write!(f, "api_error"),
        }
    }
}

/// How the generation pipeline reacts to a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried locally with backoff; fatal once retries run out.
    Transient,
    /// Handed to credential failover; fatal when no alternate exists.
    CredentialExhausted,
    /// Ends the generation.
    Fatal,
}

/// Structured error from the provider with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    /// Error category
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl ProviderError {
    /// Creates a new provider error.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an error from a non-success HTTP status.
    pub fn http_status(status: u16, body: &str) -> Self {
        let kind = kind_for_status(status);
        if body.is_empty() {
            return Self::new(kind, format!("HTTP {status}"));
        }

        // Prefer the provider's own message when the body is a JSON error object
        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(error_obj) = json.get("error")
        {
            let msg = error_obj
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error_obj.as_str());
            if let Some(msg) = msg {
                return Self {
                    kind,
                    message: format!("HTTP {status}: {msg}"),
                    details: Some(body.to_string()),
                };
            }
        }

        Self {
            kind,
            message: format!("HTTP {status}"),
            details: Some(body.to_string()),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Creates an error from a mid-stream error object, keyed by its status string.
    pub fn api_error(status: &str, message: &str) -> Self {
        let kind = match status {
            "RESOURCE_EXHAUSTED" | "429" => ProviderErrorKind::RateLimited,
            "UNAVAILABLE" | "INTERNAL" | "500" | "503" => ProviderErrorKind::Unavailable,
            "DEADLINE_EXCEEDED" | "504" => ProviderErrorKind::Timeout,
            "UNAUTHENTICATED" | "PERMISSION_DENIED" | "401" | "403" => ProviderErrorKind::Auth,
            "INVALID_ARGUMENT" | "NOT_FOUND" | "FAILED_PRECONDITION" | "400" | "404" => {
                ProviderErrorKind::InvalidRequest
            }
            _ => ProviderErrorKind::Api,
        };
        Self::new(kind, format!("{status}: {message}"))
    }

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            ProviderErrorKind::Timeout | ProviderErrorKind::Unavailable => ErrorClass::Transient,
            ProviderErrorKind::RateLimited | ProviderErrorKind::Auth => {
                ErrorClass::CredentialExhausted
            }
            ProviderErrorKind::InvalidRequest
            | ProviderErrorKind::Parse
            | ProviderErrorKind::Api => ErrorClass::Fatal,
        }
    }

    /// Whether a failed call may be retried as-is with backoff.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

fn kind_for_status(status: u16) -> ProviderErrorKind {
    match status {
        408 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::RateLimited,
        401 | 403 => ProviderErrorKind::Auth,
        500..=599 => ProviderErrorKind::Unavailable,
        _ => ProviderErrorKind::InvalidRequest,
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Maps transport failures onto the provider error taxonomy.
pub fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::new(
            ProviderErrorKind::Unavailable,
            format!("Connection failed: {e}"),
        )
    } else if e.is_builder() {
        ProviderError::new(
            ProviderErrorKind::InvalidRequest,
            format!("Request error: {e}"),
        )
    } else if e.is_decode() {
        ProviderError::new(ProviderErrorKind::Parse, format!("Decode error: {e}"))
    } else {
        ProviderError::new(
            ProviderErrorKind::Unavailable,
            format!("Network error: {e}"),
        )
    }
}

/// Token usage reported at the end of a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Events emitted by a provider stream. The stream ending is the completion signal.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental response text
    TextDelta { text: String },
    /// Progress annotation that is not part of the response body
    Status { text: String },
    /// Token counts; the last one seen wins
    Usage(Usage),
}

/// Boxed stream of provider events.
pub type ProviderStream = BoxStream<'static, ProviderResult<StreamEvent>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_maps_kinds() {
        assert_eq!(
            ProviderError::http_status(429, "").kind,
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            ProviderError::http_status(503, "").kind,
            ProviderErrorKind::Unavailable
        );
        assert_eq!(
            ProviderError::http_status(403, "").kind,
            ProviderErrorKind::Auth
        );
        assert_eq!(
            ProviderError::http_status(404, "").kind,
            ProviderErrorKind::InvalidRequest
        );
    }

    /// JSON error bodies contribute their message; the raw body is kept as details.
    #[test]
    fn test_http_status_extracts_json_message() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = ProviderError::http_status(429, body);
        assert_eq!(err.message, "HTTP 429: Quota exceeded");
        assert_eq!(err.details.as_deref(), Some(body));

        let plain = ProviderError::http_status(500, "boom");
        assert_eq!(plain.message, "HTTP 500");
        assert_eq!(plain.details.as_deref(), Some("boom"));
    }

    #[test]
    fn test_api_error_uses_status_string() {
        let err = ProviderError::api_error("RESOURCE_EXHAUSTED", "slow down");
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert_eq!(err.to_string(), "RESOURCE_EXHAUSTED: slow down");

        assert_eq!(
            ProviderError::api_error("SOMETHING_ELSE", "x").kind,
            ProviderErrorKind::Api
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ProviderError::timeout("t").class(),
            ErrorClass::Transient
        );
        assert!(ProviderError::http_status(502, "").is_retryable());
        assert_eq!(
            ProviderError::http_status(429, "").class(),
            ErrorClass::CredentialExhausted
        );
        assert!(!ProviderError::http_status(429, "").is_retryable());
        assert_eq!(
            ProviderError::new(ProviderErrorKind::Parse, "bad").class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_resolve_base_url_prefers_config_over_default() {
        let url = resolve_base_url(
            Some("http://127.0.0.1:9999/v1/"),
            "DUET_TEST_UNSET_BASE_URL",
            "https://example.invalid",
            "Test",
        )
        .unwrap();
        assert_eq!(url, "http://127.0.0.1:9999/v1");

        let fallback =
            resolve_base_url(None, "DUET_TEST_UNSET_BASE_URL", "https://example.invalid", "Test")
                .unwrap();
        assert_eq!(fallback, "https://example.invalid");
    }

    #[test]
    fn test_resolve_base_url_rejects_garbage() {
        let err = resolve_base_url(Some("not a url"), "DUET_TEST_UNSET_BASE_URL", "x", "Test");
        assert!(err.is_err());
    }
}
