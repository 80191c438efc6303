//! Events flowing from workers and timers to the dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::token::GenerationToken;
use crate::providers::Usage;

/// One of the two chat sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionId {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}

impl SessionId {
    pub const ALL: [SessionId; 2] = [SessionId::One, SessionId::Two];

    pub fn peer(self) -> SessionId {
        match self {
            SessionId::One => SessionId::Two,
            SessionId::Two => SessionId::One,
        }
    }

    pub fn index(self) -> usize {
        match self {
            SessionId::One => 0,
            SessionId::Two => 1,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            SessionId::One => 1,
            SessionId::Two => 2,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(SessionId::One),
            2 => Some(SessionId::Two),
            _ => None,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Queue entry. Never mutated after it is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Queue-assigned sequence number, unique per queue.
    pub seq: u64,
    pub session: SessionId,
    pub token: GenerationToken,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Generation (or a failover continuation of it) has begun.
    StreamStart,
    StreamChunk {
        text: String,
    },
    /// Terminal success. Emitted even when the text is empty.
    StreamEnd {
        full_text: String,
        usage: Option<Usage>,
    },
    /// Transient progress annotation, not part of the message body.
    StatusUpdate {
        text: String,
    },
    SystemNotice {
        text: String,
    },
    Error {
        text: String,
        fatal: bool,
    },
    /// The worker moved to another credential after a failover.
    CredentialSwitched {
        credential_id: String,
    },
    CountdownTick {
        handoff: u64,
        remaining_secs: u64,
    },
    /// Countdown noticed that auto-reply was turned off.
    CountdownCancelled {
        handoff: u64,
    },
    AutoReplyDue {
        handoff: u64,
        text: String,
    },
}

impl EventKind {
    /// Whether the generation token decides if this event still applies.
    ///
    /// Countdown events are matched by hand-off id instead.
    pub fn is_token_scoped(&self) -> bool {
        !matches!(
            self,
            EventKind::CountdownTick { .. }
                | EventKind::CountdownCancelled { .. }
                | EventKind::AutoReplyDue { .. }
        )
    }

    /// Applied even when the token is stale.
    pub fn survives_stale_token(&self) -> bool {
        matches!(
            self,
            EventKind::Error { .. } | EventKind::SystemNotice { .. } | EventKind::StreamEnd { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StreamStart => "stream_start",
            EventKind::StreamChunk { .. } => "stream_chunk",
            EventKind::StreamEnd { .. } => "stream_end",
            EventKind::StatusUpdate { .. } => "status_update",
            EventKind::SystemNotice { .. } => "system_notice",
            EventKind::Error { .. } => "error",
            EventKind::CredentialSwitched { .. } => "credential_switched",
            EventKind::CountdownTick { .. } => "countdown_tick",
            EventKind::CountdownCancelled { .. } => "countdown_cancelled",
            EventKind::AutoReplyDue { .. } => "auto_reply_due",
        }
    }
}
