//! Gemini SSE stream parser.

use std::collections::VecDeque;
use std::pin::Pin;

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde_json::Value;

use crate::providers::{ProviderError, ProviderErrorKind, ProviderResult, StreamEvent, Usage};

/// Gemini SSE stream parser.
///
/// Parses Server-Sent Events from `streamGenerateContent?alt=sse` and
/// converts them to normalized `StreamEvent`s. Usage is emitted once, after
/// the last text delta.
pub struct GeminiSseParser<S> {
    inner: EventStream<S>,
    pending: VecDeque<StreamEvent>,
    final_usage: Option<Usage>,
    usage_emitted: bool,
}

impl<S> GeminiSseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
            pending: VecDeque::new(),
            final_usage: None,
            usage_emitted: false,
        }
    }

    fn handle_event_data(&mut self, data: &str) -> ProviderResult<()> {
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return Ok(());
        }

        let value = serde_json::from_str::<Value>(trimmed).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Parse,
                format!("Failed to parse SSE JSON: {err}"),
            )
        })?;
        self.handle_chunk(&value)
    }

    fn handle_chunk(&mut self, value: &Value) -> ProviderResult<()> {
        if let Some(error) = value.get("error") {
            let status = error
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    error
                        .get("code")
                        .map(|code| code.to_string().trim_matches('"').to_string())
                })
                .unwrap_or_else(|| "error".to_string());
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(ProviderError::api_error(&status, message));
        }

        if let Some(reason) = value
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                format!("Prompt blocked: {reason}"),
            ));
        }

        if let Some(usage) = value.get("usageMetadata") {
            let prompt = usage
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let completion = usage
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.final_usage = Some(Usage {
                input_tokens: prompt,
                output_tokens: completion,
            });
        }

        let Some(candidate) = value
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return Ok(());
        };

        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            let combined_text: String = parts
                .iter()
                .filter(|part| {
                    !part
                        .get("thought")
                        .and_then(Value::as_bool)
                        .unwrap_or(false)
                })
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();

            // Each chunk carries only the text generated since the previous one
            if !combined_text.is_empty() {
                self.pending.push_back(StreamEvent::TextDelta {
                    text: combined_text,
                });
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str)
            && !matches!(reason, "STOP" | "MAX_TOKENS" | "FINISH_REASON_UNSPECIFIED")
        {
            self.pending.push_back(StreamEvent::Status {
                text: format!("Response ended early: {}", reason.to_lowercase()),
            });
        }

        Ok(())
    }
}

impl<S, E> Stream for GeminiSseParser<S>
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
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            let inner = Pin::new(&mut self.inner);
            match inner.poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Err(err) = self.handle_event_data(&event.data) {
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ProviderError::new(
                        ProviderErrorKind::Unavailable,
                        format!("SSE stream error: {e}"),
                    ))));
                }
                Poll::Ready(None) => {
                    if !self.usage_emitted
                        && let Some(usage) = self.final_usage
                    {
                        self.usage_emitted = true;
                        return Poll::Ready(Some(Ok(StreamEvent::Usage(usage))));
                    }
                    return Poll::Ready(None);
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
    use serde_json::json;

    use super::*;

    fn parser() -> GeminiSseParser<stream::Empty<Result<Bytes, reqwest::Error>>> {
        GeminiSseParser::new(stream::empty())
    }

    fn text_chunk(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    fn drain_text(parser: &mut GeminiSseParser<impl Sized>) -> Vec<String> {
        parser
            .pending
            .drain(..)
            .filter_map(|e| match e {
                StreamEvent::TextDelta { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_incremental_chunks_pass_through() {
        let mut parser = parser();
        parser.handle_chunk(&text_chunk("Hel")).unwrap();
        parser.handle_chunk(&text_chunk("lo")).unwrap();
        assert_eq!(drain_text(&mut parser), ["Hel", "lo"]);
    }

    /// A chunk that repeats or extends the previous one is still new text.
    #[test]
    fn test_repeated_chunks_are_all_kept() {
        let mut parser = parser();
        parser.handle_chunk(&text_chunk("ha")).unwrap();
        parser.handle_chunk(&text_chunk("ha")).unwrap();
        parser.handle_chunk(&text_chunk("ha!")).unwrap();
        assert_eq!(drain_text(&mut parser).concat(), "hahaha!");
    }

    #[tokio::test]
    async fn test_stream_keeps_repeated_text() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ha\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ha\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ha!\"}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let bytes = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from(body))]);
        let text: String = GeminiSseParser::new(bytes)
            .filter_map(|event| async move {
                match event.unwrap() {
                    StreamEvent::TextDelta { text } => Some(text),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(text, "hahaha!");
    }

    /// Thought parts are reasoning, not response text.
    #[test]
    fn test_thought_parts_are_skipped() {
        let mut parser = parser();
        let chunk = json!({
            "candidates": [{
                "content": { "parts": [
                    { "thought": true, "text": "thinking..." },
                    { "text": "answer" }
                ]}
            }]
        });
        parser.handle_chunk(&chunk).unwrap();
        assert_eq!(drain_text(&mut parser), ["answer"]);
    }

    #[test]
    fn test_error_object_is_classified() {
        let mut parser = parser();
        let err = parser
            .handle_chunk(&json!({
                "error": { "code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED" }
            }))
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);

        let err = parser
            .handle_chunk(&json!({ "error": { "code": 503, "message": "Overloaded" } }))
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
    }

    #[test]
    fn test_blocked_prompt_is_invalid_request() {
        let mut parser = parser();
        let err = parser
            .handle_chunk(&json!({ "promptFeedback": { "blockReason": "SAFETY" } }))
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
    }

    #[test]
    fn test_abnormal_finish_reason_emits_status() {
        let mut parser = parser();
        parser
            .handle_chunk(&json!({ "candidates": [{ "finishReason": "SAFETY" }] }))
            .unwrap();
        assert_eq!(
            parser.pending.pop_front(),
            Some(StreamEvent::Status {
                text: "Response ended early: safety".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_stream_yields_text_then_usage() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}],\"role\":\"model\"}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" there\"}],\"role\":\"model\"},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":7,\"candidatesTokenCount\":3}}\n\n",
        );
        let bytes = stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from(body))]);
        let events: Vec<_> = GeminiSseParser::new(bytes).collect().await;

        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta {
                    text: "Hi".to_string()
                },
                StreamEvent::TextDelta {
                    text: " there".to_string()
                },
                StreamEvent::Usage(Usage {
                    input_tokens: 7,
                    output_tokens: 3
                }),
            ]
        );
    }
}
