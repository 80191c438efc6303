use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Credential, CredentialPool, Health};

/// Checks whether a credential is currently usable.
pub trait CredentialProbe: Send + Sync {
    fn probe<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Health>;
}

/// Probes every credential in the pool once and stores the results.
pub async fn refresh_once(pool: &CredentialPool, probe: &dyn CredentialProbe) {
    for credential in pool.iter() {
        let health = probe.probe(credential).await;
        let previous = credential.health();
        credential.set_health(health);
        if previous != health {
            info!(credential = credential.id(), %previous, %health, "credential health changed");
        }
    }
}

/// Refreshes pool health on a fixed interval until `cancel` fires.
///
/// The first refresh happens one `interval` after spawning. Call
/// [`refresh_once`] beforehand for an up-front check.
pub fn spawn_health_refresher(
    pool: Arc<CredentialPool>,
    probe: Arc<dyn CredentialProbe>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("health refresher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    refresh_once(&pool, probe.as_ref()).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct MapProbe {
        results: HashMap<String, Health>,
        calls: AtomicUsize,
    }

    impl CredentialProbe for MapProbe {
        fn probe<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Health> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let health = self
                .results
                .get(credential.id())
                .copied()
                .unwrap_or(Health::Unknown);
            Box::pin(async move { health })
        }
    }

    fn probe(results: &[(&str, Health)]) -> Arc<MapProbe> {
        Arc::new(MapProbe {
            results: results
                .iter()
                .map(|(id, h)| ((*id).to_string(), *h))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_refresh_once_stores_probe_results() {
        let pool = CredentialPool::new(vec![
            Credential::new("a", "sa", ""),
            Credential::new("b", "sb", "").with_health(Health::Healthy),
        ]);
        let probe = probe(&[("a", Health::Healthy), ("b", Health::Invalid)]);

        refresh_once(&pool, probe.as_ref()).await;

        assert_eq!(pool.get("a").unwrap().health(), Health::Healthy);
        assert_eq!(pool.get("b").unwrap().health(), Health::Invalid);
    }

    /// A suspect credential comes back once the refresher sees it healthy.
    #[tokio::test(start_paused = true)]
    async fn test_refresher_runs_periodically_and_stops_on_cancel() {
        let pool = Arc::new(CredentialPool::new(vec![
            Credential::new("a", "sa", "").with_health(Health::Suspect),
        ]));
        let probe = probe(&[("a", Health::Healthy)]);
        let cancel = CancellationToken::new();

        let handle = spawn_health_refresher(
            Arc::clone(&pool),
            Arc::clone(&probe) as Arc<dyn CredentialProbe>,
            Duration::from_secs(600),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.get("a").unwrap().health(), Health::Suspect);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(pool.get("a").unwrap().health(), Health::Healthy);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
