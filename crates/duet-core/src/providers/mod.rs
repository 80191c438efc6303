//! LLM provider clients.

pub mod gemini;
pub mod ollama;
mod shared;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
pub use shared::{
    ChatMessage, ChatRole, ErrorClass, ProviderError, ProviderErrorKind, ProviderResult,
    ProviderStream, StreamEvent, USER_AGENT, Usage, classify_reqwest_error, env_api_key,
    http_client, resolve_base_url,
};

use crate::config::Config;
use crate::core::events::SessionId;
use crate::credentials::{Credential, CredentialPool, CredentialProbe};

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Gemini,
    Ollama,
}

impl ProviderKind {
    /// Parses a config id. "google" is accepted as an alias for Gemini.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Some(ProviderKind::Gemini),
            "ollama" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Everything a provider needs for one call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub session: SessionId,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    /// Prior turns, oldest first. Never includes `prompt`.
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    /// Set for pooled providers.
    pub credential: Option<Arc<Credential>>,
}

impl ProviderRequest {
    /// History followed by the prompt as a user turn.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

/// A backend that turns a request into a stream of events.
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Starts a streaming call. Errors before the first byte are returned
    /// directly; later ones arrive through the stream.
    fn send<'a>(&'a self, request: &'a ProviderRequest) -> BoxFuture<'a, ProviderResult<ProviderStream>>;
}

struct RegistryEntry {
    client: Arc<dyn ProviderClient>,
    pool: Option<Arc<CredentialPool>>,
    probe: Option<Arc<dyn CredentialProbe>>,
}

/// Maps provider ids to clients and, for pooled providers, their credentials.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<ProviderKind, RegistryEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the Gemini and Ollama clients from config.
    ///
    /// # Errors
    /// Returns an error if a configured base URL is malformed or an HTTP
    /// client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();

        let gemini = Arc::new(gemini::GeminiClient::new(gemini::GeminiConfig::from_config(
            &config.providers.gemini,
        )?)?);
        let pool = Arc::new(CredentialPool::new(config.providers.gemini.credentials()));
        registry.register_pooled(
            Arc::clone(&gemini) as Arc<dyn ProviderClient>,
            pool,
            Some(gemini as Arc<dyn CredentialProbe>),
        );

        let ollama = ollama::OllamaClient::new(ollama::OllamaConfig::from_config(
            &config.providers.ollama,
        )?)?;
        registry.register(Arc::new(ollama));

        Ok(registry)
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.entries.insert(
            client.kind(),
            RegistryEntry {
                client,
                pool: None,
                probe: None,
            },
        );
    }

    pub fn register_pooled(
        &mut self,
        client: Arc<dyn ProviderClient>,
        pool: Arc<CredentialPool>,
        probe: Option<Arc<dyn CredentialProbe>>,
    ) {
        self.entries.insert(
            client.kind(),
            RegistryEntry {
                client,
                pool: Some(pool),
                probe,
            },
        );
    }

    pub fn client(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderClient>> {
        self.entries.get(&kind).map(|e| Arc::clone(&e.client))
    }

    pub fn pool(&self, kind: ProviderKind) -> Option<Arc<CredentialPool>> {
        self.entries.get(&kind).and_then(|e| e.pool.clone())
    }

    pub fn probe(&self, kind: ProviderKind) -> Option<Arc<dyn CredentialProbe>> {
        self.entries.get(&kind).and_then(|e| e.probe.clone())
    }

    /// Pooled providers that have a health probe, for the refresher.
    pub fn probed_pools(&self) -> Vec<(ProviderKind, Arc<CredentialPool>, Arc<dyn CredentialProbe>)> {
        let mut pools: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(kind, entry)| {
                let pool = entry.pool.clone()?;
                let probe = entry.probe.clone()?;
                Some((*kind, pool, probe))
            })
            .collect();
        pools.sort_by_key(|(kind, _, _)| kind.id());
        pools
    }
}
