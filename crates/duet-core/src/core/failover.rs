//! Credential failover for pooled providers.
//!
//! One coordinator lives for one generation attempt. It remembers every
//! credential already tried so a chain of failures visits each key at most
//! once and always terminates.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::credentials::{Credential, CredentialPool, Health};
use crate::providers::ProviderError;

pub struct FailoverCoordinator {
    pool: Arc<CredentialPool>,
    visited: HashSet<String>,
}

impl FailoverCoordinator {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            pool,
            visited: HashSet::new(),
        }
    }

    /// Picks the credential for the first attempt.
    ///
    /// A configured id wins regardless of health; otherwise the first healthy
    /// credential, falling back to the first declared one.
    pub fn initial(&mut self, preferred: Option<&str>) -> Option<Arc<Credential>> {
        let chosen = preferred
            .and_then(|id| self.pool.get(id))
            .or_else(|| self.pool.next_healthy_after(None, |_| false))
            .or_else(|| self.pool.first())?;
        self.visited.insert(chosen.id().to_string());
        Some(chosen)
    }

    /// Marks `failed` suspect and returns the next untried healthy credential.
    pub fn next_after_failure(&mut self, failed: &Credential) -> Option<Arc<Credential>> {
        failed.set_health(Health::Suspect);
        self.visited.insert(failed.id().to_string());

        let next = self
            .pool
            .next_healthy_after(Some(failed.id()), |c| self.visited.contains(c.id()))?;
        self.visited.insert(next.id().to_string());
        info!(from = failed.id(), to = next.id(), "credential failover");
        Some(next)
    }

    /// Number of distinct credentials tried so far.
    pub fn attempts(&self) -> usize {
        self.visited.len()
    }
}

/// Notice shown when a generation moves to another credential.
pub fn switch_notice(from: &Credential, to: &Credential) -> String {
    format!("Key failed, switching: {} → {}", from.label(), to.label())
}

/// Fatal message once every credential has failed.
pub fn exhausted_message(last_error: &ProviderError) -> String {
    format!("Failover failed, no more keys available. Last error: {last_error}")
}
