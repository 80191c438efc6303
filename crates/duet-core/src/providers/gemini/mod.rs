//! Google Gemini provider (Generative Language API, API key auth).

mod api;
mod sse;

pub use api::{DEFAULT_BASE_URL, GeminiClient, GeminiConfig};
pub use sse::GeminiSseParser;
