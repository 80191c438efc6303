//! Credential listing.

use anyhow::{Context, Result};
use duet_core::config::Config;
use duet_core::credentials::refresh_once;
use duet_core::providers::ProviderRegistry;

/// Probes every pooled key once and prints one line per key.
pub async fn run(config: &Config) -> Result<()> {
    let registry = ProviderRegistry::from_config(config).context("build providers")?;

    let pools = registry.probed_pools();
    if pools.iter().all(|(_, pool, _)| pool.is_empty()) {
        println!("No API keys configured.");
        return Ok(());
    }

    for (kind, pool, probe) in pools {
        if pool.is_empty() {
            continue;
        }
        refresh_once(&pool, probe.as_ref()).await;
        println!("{kind}:");
        for credential in pool.iter() {
            let note = credential.note();
            if note.is_empty() {
                println!("  {:<24} {}", credential.id(), credential.health().label());
            } else {
                println!("  {:<24} {:<8} {note}", credential.id(), credential.health().label());
            }
        }
    }
    Ok(())
}
