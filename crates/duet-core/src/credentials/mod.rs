//! Rotatable credential pools.
//!
//! A pool holds interchangeable API keys for one provider. Health is stored
//! per credential in an atomic so the failover path and the background
//! refresher never contend on a lock.

mod health;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub use health::{CredentialProbe, refresh_once, spawn_health_refresher};

/// Last-known health of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Health {
    Unknown = 0,
    Healthy = 1,
    /// Failed recently; skipped by failover until the next refresh.
    Suspect = 2,
    /// Rejected by the provider.
    Invalid = 3,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Health::Healthy,
            2 => Health::Suspect,
            3 => Health::Invalid,
            _ => Health::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Suspect => "suspect",
            Health::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One API key plus its display note and health.
pub struct Credential {
    id: String,
    secret: String,
    note: String,
    health: AtomicU8,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            note: note.into(),
            health: AtomicU8::new(Health::Unknown as u8),
        }
    }

    #[must_use]
    pub fn with_health(self, health: Health) -> Self {
        self.set_health(health);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    /// Note when present, otherwise the id.
    pub fn label(&self) -> &str {
        if self.note.trim().is_empty() {
            &self.id
        } else {
            &self.note
        }
    }

    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_health(&self, health: Health) {
        self.health.store(health as u8, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("note", &self.note)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

/// Credentials in declaration order.
#[derive(Debug, Default)]
pub struct CredentialPool {
    credentials: Vec<Arc<Credential>>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials: credentials.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Credential>> {
        self.credentials.iter()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Credential>> {
        self.credentials.iter().find(|c| c.id == id).map(Arc::clone)
    }

    pub fn first(&self) -> Option<Arc<Credential>> {
        self.credentials.first().map(Arc::clone)
    }

    /// Next healthy credential after `excluding`, wrapping around once.
    pub fn get_next_available(&self, excluding: &str) -> Option<Arc<Credential>> {
        self.next_healthy_after(Some(excluding), |c| c.id() == excluding)
    }

    /// Walks the pool starting after `start` (or at the front), returning the
    /// first healthy credential that `skip` does not reject.
    pub fn next_healthy_after<F>(&self, start: Option<&str>, skip: F) -> Option<Arc<Credential>>
    where
        F: Fn(&Credential) -> bool,
    {
        let len = self.credentials.len();
        if len == 0 {
            return None;
        }
        let offset = start
            .and_then(|id| self.credentials.iter().position(|c| c.id == id))
            .map_or(0, |pos| pos + 1);

        (0..len)
            .map(|step| &self.credentials[(offset + step) % len])
            .find(|c| c.is_healthy() && !skip(c))
            .map(Arc::clone)
    }
}
