//! Rendering callbacks invoked by the dispatcher.
//!
//! Every method is a notification. Implementations must return promptly;
//! the dispatcher calls them on its own task between drains.

use super::events::SessionId;
use super::session::{Message, Phase, TokenUsage};

#[allow(unused_variables)]
pub trait SessionView {
    /// Input state changed (enable/disable send and stop).
    fn phase_changed(&mut self, session: SessionId, phase: Phase) {}

    /// A response began; any partial text on screen is discarded.
    fn stream_started(&mut self, session: SessionId) {}

    fn stream_chunk(&mut self, session: SessionId, text: &str) {}

    fn message_appended(&mut self, session: SessionId, message: &Message) {}

    /// History was replaced wholesale; redraw from `history`.
    fn history_reset(&mut self, session: SessionId, history: &[Message]) {}

    /// Transient status line. `None` clears it.
    fn status(&mut self, session: SessionId, text: Option<&str>) {}

    /// Auto-reply countdown in seconds. `None` hides it.
    fn countdown(&mut self, session: SessionId, remaining_secs: Option<u64>) {}

    fn usage(&mut self, session: SessionId, usage: TokenUsage) {}

    fn credential_changed(&mut self, session: SessionId, credential_id: &str) {}
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullView;

impl SessionView for NullView {}
