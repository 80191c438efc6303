//! Ollama provider (local `/api/chat`, newline-delimited JSON stream).

use std::collections::VecDeque;
use std::pin::Pin;

use anyhow::Result;
use bytes::BytesMut;
use futures_util::Stream;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::OllamaProviderConfig;
use crate::providers::{
    ChatRole, ProviderClient, ProviderError, ProviderErrorKind, ProviderKind, ProviderRequest,
    ProviderResult, ProviderStream, StreamEvent, USER_AGENT, Usage, classify_reqwest_error,
    http_client, resolve_base_url,
};

pub const DEFAULT_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub host: String,
}

impl OllamaConfig {
    /// Resolves the host. `OLLAMA_HOST` overrides the config value.
    ///
    /// # Errors
    /// Returns an error if the resolved URL is malformed.
    pub fn from_config(config: &OllamaProviderConfig) -> Result<Self> {
        let host = resolve_base_url(config.host.as_deref(), "OLLAMA_HOST", DEFAULT_HOST, "Ollama")?;
        Ok(Self { host })
    }
}

pub struct OllamaClient {
    config: OllamaConfig,
    http: reqwest::Client,
}

impl OllamaClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        Ok(Self {
            config,
            http: http_client()?,
        })
    }

    /// Opens a streaming `/api/chat` call.
    ///
    /// # Errors
    /// Returns a classified error if the request fails or the server answers
    /// with a non-success status.
    pub async fn send_messages_stream(&self, request: &ProviderRequest) -> ProviderResult<ProviderStream> {
        let url = format!("{}/api/chat", self.config.host);
        debug!(session = %request.session, model = %request.model, "ollama request");

        let response = self
            .http
            .post(&url)
            .header("user-agent", USER_AGENT)
            .json(&build_chat_request(request))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ollama_error(status.as_u16(), &body));
        }

        Ok(Box::pin(NdjsonParser::new(response.bytes_stream())))
    }
}

impl ProviderClient for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn send<'a>(&'a self, request: &'a ProviderRequest) -> BoxFuture<'a, ProviderResult<ProviderStream>> {
        Box::pin(self.send_messages_stream(request))
    }
}

fn build_chat_request(request: &ProviderRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in request.messages() {
        let role = match message.role {
            ChatRole::User => "user",
            ChatRole::Model => "assistant",
        };
        messages.push(json!({ "role": role, "content": message.text }));
    }

    json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
        "options": { "temperature": request.temperature },
    })
}

/// Ollama reports errors as `{"error": "..."}`; a missing model is a 404.
fn ollama_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string));
    match message {
        Some(msg) => classify_error_text(&msg),
        None => ProviderError::http_status(status, body),
    }
}

fn classify_error_text(message: &str) -> ProviderError {
    let kind = if message.contains("not found") {
        ProviderErrorKind::InvalidRequest
    } else {
        ProviderErrorKind::Unavailable
    };
    ProviderError::new(kind, format!("Ollama: {message}"))
}

/// Splits an NDJSON byte stream into chat events.
pub struct NdjsonParser<S> {
    inner: S,
    buffer: BytesMut,
    pending: VecDeque<ProviderResult<StreamEvent>>,
    done: bool,
}

impl<S> NdjsonParser<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        if self.done {
            return;
        }
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(err) => {
                self.fail(ProviderError::new(
                    ProviderErrorKind::Parse,
                    format!("Failed to parse Ollama chunk: {err}"),
                ));
                return;
            }
        };

        if let Some(message) = value.get("error").and_then(Value::as_str) {
            self.fail(classify_error_text(message));
            return;
        }

        if let Some(content) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        {
            self.pending.push_back(Ok(StreamEvent::TextDelta {
                text: content.to_string(),
            }));
        }

        if value.get("done").and_then(Value::as_bool).unwrap_or(false) {
            let count = |field: &str| value.get(field).and_then(Value::as_u64).unwrap_or(0);
            self.pending.push_back(Ok(StreamEvent::Usage(Usage {
                input_tokens: count("prompt_eval_count"),
                output_tokens: count("eval_count"),
            })));
            self.done = true;
        }
    }

    fn fail(&mut self, err: ProviderError) {
        self.pending.push_back(Err(err));
        self.done = true;
    }
}

impl<S, E> Stream for NdjsonParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    let err = ProviderError::new(
                        ProviderErrorKind::Unavailable,
                        format!("Ollama stream error: {e}"),
                    );
                    self.fail(err);
                }
                Poll::Ready(None) => {
                    // A final line without a trailing newline
                    if !self.buffer.is_empty() {
                        let rest = self.buffer.split();
                        self.handle_line(&rest);
                    }
                    self.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};

    use super::*;
    use crate::core::events::SessionId;
    use crate::providers::ChatMessage;

    async fn parse(chunks: &[&str]) -> Vec<ProviderResult<StreamEvent>> {
        let items: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        NdjsonParser::new(stream::iter(items)).collect().await
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let events = parse(&[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n{\"mess",
            "age\":{\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":5,\"eval_count\":2}",
        ])
        .await;

        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta {
                    text: "Hel".to_string()
                },
                StreamEvent::TextDelta {
                    text: "lo".to_string()
                },
                StreamEvent::Usage(Usage {
                    input_tokens: 5,
                    output_tokens: 2
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_line_ends_stream() {
        let events = parse(&[
            "{\"error\":\"model 'nope' not found\"}\n",
            "{\"message\":{\"content\":\"ignored\"},\"done\":false}\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        let err = events.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_garbage_line_is_parse_error() {
        let events = parse(&["not json\n"]).await;
        let err = events.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Parse);
    }

    #[test]
    fn test_chat_request_includes_system_and_prompt() {
        let request = ProviderRequest {
            session: SessionId::Two,
            model: "llama3".to_string(),
            system_prompt: Some("Be brief.".to_string()),
            temperature: 0.2,
            history: vec![ChatMessage::user("hi"), ChatMessage::model("hello")],
            prompt: "again".to_string(),
            credential: None,
        };
        let body = build_chat_request(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "again");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_status_errors() {
        assert_eq!(
            ollama_error(404, r#"{"error":"model \"x\" not found, try pulling it first"}"#).kind,
            ProviderErrorKind::InvalidRequest
        );
        assert_eq!(
            ollama_error(500, r#"{"error":"llama runner process has terminated"}"#).kind,
            ProviderErrorKind::Unavailable
        );
        assert_eq!(ollama_error(502, "").kind, ProviderErrorKind::Unavailable);
    }
}
