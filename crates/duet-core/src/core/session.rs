//! Per-pane session state. Only the dispatcher mutates it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use super::autoreply::PendingReply;
use super::events::SessionId;
use super::token::{GenerationToken, TokenCounter, TokenWatch};
use crate::config::SessionConfig;
use crate::providers::{ChatMessage, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A history entry.
///
/// `ui_only` entries are annotations (notices, errors) that are shown but
/// never sent to a provider or saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ui_only: bool,
    /// Model that produced a `Model` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sequence number of the event that produced a UI-only entry.
    #[serde(skip)]
    pub source_seq: Option<u64>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            ui_only: false,
            model: None,
            source_seq: None,
        }
    }

    pub fn model(text: impl Into<String>, model: Option<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            ui_only: false,
            model,
            source_seq: None,
        }
    }

    pub fn notice(text: impl Into<String>, source_seq: Option<u64>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            ui_only: true,
            model: None,
            source_seq,
        }
    }

    /// Provider form, or `None` for UI-only entries.
    pub fn to_chat(&self) -> Option<ChatMessage> {
        if self.ui_only {
            return None;
        }
        Some(match self.role {
            Role::User => ChatMessage::user(self.text.clone()),
            Role::Model => ChatMessage::model(self.text.clone()),
        })
    }
}

/// Input state of a session as the UI sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Request issued, nothing streamed yet.
    Sending,
    Streaming,
}

/// Partial response text for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAccumulator {
    pub token: GenerationToken,
    pub text: String,
}

/// Token counts for the last response and the running session total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub last: u64,
    pub total: u64,
}

/// Shared auto-reply switch. Countdown tasks read it on every tick.
#[derive(Debug, Clone, Default)]
pub struct AutoReplyFlag(Arc<AtomicBool>);

impl AutoReplyFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

pub struct SessionState {
    id: SessionId,
    history: Vec<Message>,
    tokens: TokenCounter,
    auto_reply: AutoReplyFlag,
    pending_task: Option<PendingReply>,
    phase: Phase,
    accumulator: Option<StreamAccumulator>,
    usage: TokenUsage,
    config: SessionConfig,
}

impl SessionState {
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        Self {
            id,
            history: Vec::new(),
            tokens: TokenCounter::new(),
            auto_reply: AutoReplyFlag::default(),
            pending_task: None,
            phase: Phase::Idle,
            accumulator: None,
            usage: TokenUsage::default(),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn token(&self) -> GenerationToken {
        self.tokens.current()
    }

    pub fn token_watch(&self) -> TokenWatch {
        self.tokens.watch()
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        self.tokens.current() == token
    }

    pub(crate) fn bump_token(&mut self) -> GenerationToken {
        self.tokens.bump()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_generating(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn auto_reply_enabled(&self) -> bool {
        self.auto_reply.get()
    }

    pub fn auto_reply_flag(&self) -> AutoReplyFlag {
        self.auto_reply.clone()
    }

    pub(crate) fn set_auto_reply(&self, enabled: bool) {
        self.auto_reply.set(enabled);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn accumulator(&self) -> Option<&StreamAccumulator> {
        self.accumulator.as_ref()
    }

    /// History as sent to a provider: UI-only entries removed.
    pub fn api_history(&self) -> Vec<ChatMessage> {
        self.history.iter().filter_map(Message::to_chat).collect()
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Appends a UI-only entry unless the last entry came from the same event.
    pub(crate) fn push_notice(&mut self, text: impl Into<String>, source_seq: Option<u64>) -> bool {
        if let Some(seq) = source_seq
            && self
                .history
                .last()
                .is_some_and(|m| m.ui_only && m.source_seq == Some(seq))
        {
            return false;
        }
        self.history.push(Message::notice(text, source_seq));
        true
    }

    pub(crate) fn begin_stream(&mut self, token: GenerationToken) {
        self.accumulator = Some(StreamAccumulator {
            token,
            text: String::new(),
        });
    }

    /// Appends to the accumulator of `token`, starting one if none exists.
    pub(crate) fn append_chunk(&mut self, token: GenerationToken, text: &str) -> bool {
        match &mut self.accumulator {
            Some(acc) if acc.token == token => {
                acc.text.push_str(text);
                true
            }
            Some(_) => false,
            None => {
                self.accumulator = Some(StreamAccumulator {
                    token,
                    text: text.to_string(),
                });
                true
            }
        }
    }

    /// Removes the accumulator if it belongs to `token`.
    pub(crate) fn take_accumulator_for(&mut self, token: GenerationToken) -> Option<String> {
        if self.accumulator.as_ref().is_some_and(|a| a.token == token) {
            return self.accumulator.take().map(|a| a.text);
        }
        None
    }

    pub(crate) fn record_usage(&mut self, usage: Usage) -> TokenUsage {
        let last = usage.total();
        self.usage = TokenUsage {
            last,
            total: self.usage.total + last,
        };
        self.usage
    }

    pub fn pending_task(&self) -> Option<&PendingReply> {
        self.pending_task.as_ref()
    }

    /// Stores a new hand-off, cancelling any previous one.
    pub(crate) fn set_pending(&mut self, pending: PendingReply) {
        if let Some(old) = self.pending_task.replace(pending) {
            old.cancel();
        }
    }

    /// Cancels and clears the pending hand-off. Returns whether one existed.
    pub(crate) fn cancel_pending(&mut self) -> bool {
        match self.pending_task.take() {
            Some(pending) => {
                pending.cancel();
                true
            }
            None => false,
        }
    }

    /// Clears the pending hand-off if its id is `handoff`.
    pub(crate) fn take_pending_if(&mut self, handoff: u64) -> Option<PendingReply> {
        if self.pending_task.as_ref().is_some_and(|p| p.id() == handoff) {
            return self.pending_task.take();
        }
        None
    }

    /// Clears everything a "New Session" clears and invalidates in-flight work.
    pub(crate) fn reset(&mut self) -> GenerationToken {
        self.cancel_pending();
        self.history.clear();
        self.accumulator = None;
        self.usage = TokenUsage::default();
        self.phase = Phase::Idle;
        self.bump_token()
    }

    pub(crate) fn replace_history(&mut self, history: Vec<Message>) -> GenerationToken {
        self.history = history;
        self.accumulator = None;
        self.phase = Phase::Idle;
        self.bump_token()
    }

    /// Removes the last user turn and returns its messages.
    ///
    /// The turn is the most recent non-UI-only user message plus any user
    /// messages directly before it. Everything after the turn is dropped too.
    pub(crate) fn rewind_last_turn(&mut self) -> Option<Vec<Message>> {
        let last = self
            .history
            .iter()
            .rposition(|m| m.role == Role::User && !m.ui_only)?;
        let mut first = last;
        while first > 0 && self.history[first - 1].role == Role::User && !self.history[first - 1].ui_only {
            first -= 1;
        }
        let turn = self.history[first..=last].to_vec();
        self.history.truncate(first);
        Some(turn)
    }
}
