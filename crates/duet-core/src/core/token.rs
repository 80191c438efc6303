//! Generation tokens.
//!
//! Each session owns a [`TokenCounter`]. Bumping it invalidates every event
//! a running worker produces afterwards; workers hold a read-only
//! [`TokenWatch`] and stop as soon as it no longer matches their token.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifies one generation attempt within a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GenerationToken(u64);

impl GenerationToken {
    pub const INITIAL: GenerationToken = GenerationToken(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-writer token counter owned by a session.
#[derive(Debug, Default)]
pub struct TokenCounter {
    current: Arc<AtomicU64>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> GenerationToken {
        GenerationToken(self.current.load(Ordering::Acquire))
    }

    /// Advances to a fresh token and returns it.
    pub fn bump(&mut self) -> GenerationToken {
        GenerationToken(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn watch(&self) -> TokenWatch {
        TokenWatch {
            current: Arc::clone(&self.current),
        }
    }
}

/// Read-only view of a session's current token.
#[derive(Debug, Clone)]
pub struct TokenWatch {
    current: Arc<AtomicU64>,
}

impl TokenWatch {
    pub fn current(&self) -> GenerationToken {
        GenerationToken(self.current.load(Ordering::Acquire))
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        self.current() == token
    }
}
