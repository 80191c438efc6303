//! Config command handlers.

use anyhow::{Context, Result};
use duet_core::config;
use duet_core::core::autoreply::{DelayDecision, parse_delay};

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}

pub fn set_delay(minutes: &str) -> Result<()> {
    let minutes = minutes.trim();
    if let DelayDecision::Immediate { fallback: Some(_) } = parse_delay(minutes) {
        anyhow::bail!("Invalid auto-reply delay \"{minutes}\": expected a number of minutes");
    }

    let config_path = config::paths::config_path();
    config::Config::save_auto_reply_delay_to(&config_path, minutes)
        .with_context(|| format!("save delay to {}", config_path.display()))?;
    println!("Auto-reply delay set to {minutes} min");
    Ok(())
}
