//! Delayed hand-off of one session's output to its peer.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{EventKind, SessionId};
use super::queue::EventSender;
use super::session::AutoReplyFlag;
use super::token::GenerationToken;

const TICK: Duration = Duration::from_secs(1);

/// How a configured delay string is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayDecision {
    /// Send now. `fallback` explains why when the input was unusable.
    Immediate { fallback: Option<String> },
    Countdown(Duration),
}

/// Parses a delay in minutes. Invalid input counts as zero.
pub fn parse_delay(raw: &str) -> DelayDecision {
    let trimmed = raw.trim();
    let minutes = match trimmed.parse::<f64>() {
        Ok(minutes) if minutes.is_finite() => minutes,
        _ => {
            return DelayDecision::Immediate {
                fallback: Some(format!(
                    "Invalid auto-reply delay \"{trimmed}\", sending immediately."
                )),
            };
        }
    };
    if minutes <= 0.0 {
        return DelayDecision::Immediate { fallback: None };
    }
    let secs = ((minutes * 60.0) as u64).max(1);
    DelayDecision::Countdown(Duration::from_secs(secs))
}

/// `MM:SS` for the countdown display.
pub fn format_countdown(remaining_secs: u64) -> String {
    format!("{:02}:{:02}", remaining_secs / 60, remaining_secs % 60)
}

/// Handle to an armed countdown. Dropping it cancels the countdown.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    armed_by: SessionId,
    cancel: CancellationToken,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session whose output is being handed off.
    pub fn armed_by(&self) -> SessionId {
        self.armed_by
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Result of [`AutoReplyScheduler::schedule`].
#[derive(Debug)]
pub enum Scheduled {
    Immediate {
        fallback_notice: Option<String>,
    },
    Countdown {
        pending: PendingReply,
        secs: u64,
        notice: String,
    },
}

pub struct AutoReplyScheduler {
    delay: String,
    next_id: u64,
    events: EventSender,
}

impl AutoReplyScheduler {
    pub fn new(delay: impl Into<String>, events: EventSender) -> Self {
        Self {
            delay: delay.into(),
            next_id: 1,
            events,
        }
    }

    pub fn delay(&self) -> &str {
        &self.delay
    }

    pub fn set_delay(&mut self, delay: impl Into<String>) {
        self.delay = delay.into();
    }

    /// Decides how `text` reaches `target` and, for a delay, starts the countdown.
    ///
    /// The countdown stops on its own once `guard` reads false.
    pub fn schedule(
        &mut self,
        target: SessionId,
        armed_by: SessionId,
        text: String,
        guard: AutoReplyFlag,
    ) -> Scheduled {
        let duration = match parse_delay(&self.delay) {
            DelayDecision::Immediate { fallback } => {
                debug!(%target, "auto-reply sends immediately");
                return Scheduled::Immediate {
                    fallback_notice: fallback,
                };
            }
            DelayDecision::Countdown(duration) => duration,
        };

        let id = self.next_id;
        self.next_id += 1;
        let secs = duration.as_secs();
        let cancel = CancellationToken::new();
        tokio::spawn(run_countdown(
            self.events.clone(),
            target,
            id,
            secs,
            text,
            guard,
            cancel.clone(),
        ));
        info!(%target, %armed_by, handoff = id, secs, "auto-reply armed");

        Scheduled::Countdown {
            pending: PendingReply {
                id,
                armed_by,
                cancel,
            },
            secs,
            notice: format!("Auto-reply to session {target} in {secs} s."),
        }
    }
}

async fn run_countdown(
    events: EventSender,
    target: SessionId,
    handoff: u64,
    secs: u64,
    text: String,
    guard: AutoReplyFlag,
    cancel: CancellationToken,
) {
    // Countdown events are matched by hand-off id, not by token
    let token = GenerationToken::INITIAL;
    let mut remaining = secs;
    let mut ticker = tokio::time::interval(TICK);
    ticker.tick().await;
    if cancel.is_cancelled() {
        return;
    }
    events.send(
        target,
        token,
        EventKind::CountdownTick {
            handoff,
            remaining_secs: remaining,
        },
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(%target, handoff, "countdown cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !guard.get() {
            debug!(%target, handoff, "auto-reply switched off during countdown");
            events.send(target, token, EventKind::CountdownCancelled { handoff });
            return;
        }

        remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            events.send(target, token, EventKind::AutoReplyDue { handoff, text });
            return;
        }
        events.send(
            target,
            token,
            EventKind::CountdownTick {
                handoff,
                remaining_secs: remaining,
            },
        );
    }
}
