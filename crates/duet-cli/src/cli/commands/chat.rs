//! Headless chat: one prompt, optionally bounced between both sessions.

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use duet_core::config::{Config, SessionConfig};
use duet_core::core::{Dispatcher, SessionId, SessionView, interrupt};
use duet_core::credentials::{refresh_once, spawn_health_refresher};
use duet_core::providers::ProviderRegistry;
use duet_core::session_file::{self, SessionSnapshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::console::ConsoleUi;

#[derive(clap::Args, Debug)]
pub struct ChatArgs {
    /// The prompt to send
    #[arg(short, long)]
    prompt: String,

    /// Session that receives the prompt
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    session: u8,

    /// Hand each finished response to the other session
    #[arg(long)]
    auto_reply: bool,

    /// Auto-reply delay in minutes (overrides config)
    #[arg(long, value_name = "MINUTES")]
    delay: Option<String>,

    /// Total responses to collect across both sessions (0 = until idle or interrupted)
    #[arg(long, default_value_t = 1)]
    turns: u64,

    /// Override the provider of both sessions (gemini, ollama)
    #[arg(long)]
    provider: Option<String>,

    /// Override the model of both sessions
    #[arg(short, long)]
    model: Option<String>,

    /// Restore the prompted session from a saved session file
    #[arg(long, value_name = "FILE")]
    load: Option<PathBuf>,

    /// Save the prompted session when the chat ends
    #[arg(long, value_name = "FILE")]
    save: Option<PathBuf>,

    /// Write both transcripts as Markdown when the chat ends
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,
}

impl ChatArgs {
    fn apply_overrides(&self, session: &mut SessionConfig) {
        if let Some(provider) = &self.provider {
            session.provider = Some(provider.clone());
        }
        if let Some(model) = &self.model {
            session.model = Some(model.clone());
        }
    }
}

pub async fn run(args: ChatArgs, mut config: Config) -> Result<()> {
    let target = SessionId::from_number(args.session).context("session must be 1 or 2")?;
    if args.prompt.trim().is_empty() {
        anyhow::bail!("Prompt is empty");
    }

    if let Some(delay) = &args.delay {
        config.auto_reply_delay.clone_from(delay);
    }
    for id in SessionId::ALL {
        args.apply_overrides(config.session_mut(id));
    }

    let registry = Arc::new(ProviderRegistry::from_config(&config).context("build providers")?);
    let shutdown = CancellationToken::new();
    for (kind, pool, probe) in registry.probed_pools() {
        if pool.is_empty() {
            continue;
        }
        refresh_once(&pool, probe.as_ref()).await;
        debug!(provider = %kind, keys = pool.len(), "initial credential refresh done");
        spawn_health_refresher(
            pool,
            probe,
            config.health_refresh_interval(),
            shutdown.child_token(),
        );
    }

    let mut dispatcher = Dispatcher::new(&config, registry, ConsoleUi::new());

    if let Some(path) = &args.load {
        let snapshot = session_file::load(path)?;
        let mut session_config = snapshot.config;
        args.apply_overrides(&mut session_config);
        dispatcher.set_session_config(target, session_config);
        info!(session = %target, messages = snapshot.history.len(), "restored session");
        dispatcher.replace_history(target, snapshot.history);
    }

    if args.auto_reply {
        for id in SessionId::ALL {
            dispatcher.set_auto_reply(id, true);
        }
        cap_chain(&mut dispatcher, target, args.turns);
    }

    dispatcher.submit(target, &args.prompt);

    let mut stopping = false;
    let turns = args.turns;
    dispatcher
        .run_until(&shutdown, |d| {
            match interrupt::count() {
                0 => {}
                1 if !stopping => {
                    stopping = true;
                    for id in SessionId::ALL {
                        d.set_auto_reply(id, false);
                    }
                    d.stop_all();
                }
                1 => {}
                _ => return ControlFlow::Break(()),
            }
            cap_chain(d, target, turns);
            if d.is_busy() {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        })
        .await;
    shutdown.cancel();
    dispatcher.view_mut().finish();

    if let Some(path) = &args.save {
        let session = dispatcher.session(target);
        let snapshot = SessionSnapshot::new(session.config().clone(), session.history());
        session_file::save(path, &snapshot)?;
        info!(session = %target, path = %path.display(), "session saved");
    }
    if let Some(path) = &args.transcript {
        write_transcript(path, &dispatcher)?;
    }

    if interrupt::is_interrupted() {
        return Err(interrupt::InterruptedError.into());
    }
    if dispatcher.completed_responses() == 0 {
        anyhow::bail!("No response received");
    }
    Ok(())
}

/// Keeps the session that owes the final response from handing off again.
///
/// Chained responses alternate between sessions starting at `target`, so the
/// last one comes from `target` when `turns` is odd and from its peer
/// otherwise. Switching a session off drops the hand-off waiting on it, so
/// this waits until that hand-off has been submitted.
fn cap_chain<V: SessionView>(dispatcher: &mut Dispatcher<V>, target: SessionId, turns: u64) {
    if turns == 0 || dispatcher.completed_responses() + 1 < turns {
        return;
    }
    let last = if turns % 2 == 1 { target } else { target.peer() };
    let session = dispatcher.session(last);
    if session.auto_reply_enabled() && session.pending_task().is_none() {
        debug!(session = %last, turns, "turn limit reached, chaining off");
        dispatcher.set_auto_reply(last, false);
    }
}

fn write_transcript<V: SessionView>(path: &Path, dispatcher: &Dispatcher<V>) -> Result<()> {
    let mut out = String::new();
    for id in SessionId::ALL {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("## Session {id}\n\n"));
        out.push_str(&session_file::export_markdown(dispatcher.session(id).history()));
    }
    fs::write(path, out).with_context(|| format!("write transcript to {}", path.display()))
}
