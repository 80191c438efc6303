//! Single consumer of the event queue and sole owner of session state.
//!
//! User actions (submit, stop, regenerate, ...) are methods on
//! [`Dispatcher`]. Workers and countdown tasks only enqueue events; each
//! [`Dispatcher::poll`] drains everything queued and applies it in order.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::autoreply::{AutoReplyScheduler, Scheduled};
use super::events::{Event, EventKind, SessionId};
use super::queue::{EventQueue, EventSender, event_queue};
use super::session::{Message, Phase, SessionState, TokenUsage};
use super::token::GenerationToken;
use super::ui::SessionView;
use super::worker::{GenerationRequest, WorkerContext, spawn_generation};
use crate::config::{Config, SessionConfig};
use crate::providers::{ChatMessage, ProviderRegistry, Usage};

pub const STOPPED_NOTICE: &str = "Generation stopped.";
pub const RESET_NOTICE: &str = "Session reset.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regenerate {
    Resubmitted(GenerationToken),
    /// No user message to resend.
    NothingToRegenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    /// Submitted to the target right away.
    Sent(GenerationToken),
    Countdown { handoff: u64, secs: u64 },
    /// The arming session has auto-reply switched off.
    Disabled,
}

pub struct Dispatcher<V: SessionView> {
    sessions: [SessionState; 2],
    queue: EventQueue,
    events: EventSender,
    worker: WorkerContext,
    scheduler: AutoReplyScheduler,
    poll_interval: Duration,
    completed: u64,
    view: V,
}

impl<V: SessionView> Dispatcher<V> {
    pub fn new(config: &Config, registry: Arc<ProviderRegistry>, view: V) -> Self {
        let (events, queue) = event_queue();
        Self {
            sessions: SessionId::ALL.map(|id| SessionState::new(id, config.session(id).clone())),
            queue,
            worker: WorkerContext::from_config(config, registry, events.clone()),
            scheduler: AutoReplyScheduler::new(config.auto_reply_delay.clone(), events.clone()),
            events,
            poll_interval: config.poll_interval(),
            completed: 0,
            view,
        }
    }

    pub fn session(&self, id: SessionId) -> &SessionState {
        &self.sessions[id.index()]
    }

    fn session_mut(&mut self, id: SessionId) -> &mut SessionState {
        &mut self.sessions[id.index()]
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    /// A producer handle onto the dispatcher's queue.
    pub fn sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn auto_reply_delay(&self) -> &str {
        self.scheduler.delay()
    }

    /// Number of non-empty responses committed so far.
    pub fn completed_responses(&self) -> u64 {
        self.completed
    }

    /// True while any session is generating or has a hand-off pending.
    pub fn is_busy(&self) -> bool {
        self.sessions
            .iter()
            .any(|s| s.is_generating() || s.pending_task().is_some())
    }

    /// Appends `text` as a user turn and starts a generation for it.
    ///
    /// Returns `None` for blank input.
    pub fn submit(&mut self, id: SessionId, text: &str) -> Option<GenerationToken> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let session = self.session_mut(id);
        let history = session.api_history();
        let message = Message::user(text);
        session.push(message.clone());
        self.view.message_appended(id, &message);
        Some(self.start_generation(id, text.to_string(), history))
    }

    /// Bumps the token and spawns a worker for `prompt` on top of `history`.
    pub fn start_generation(&mut self, id: SessionId, prompt: String, history: Vec<ChatMessage>) -> GenerationToken {
        let session = &mut self.sessions[id.index()];
        let token = session.bump_token();
        session.set_phase(Phase::Sending);
        let request = GenerationRequest {
            session: id,
            token,
            prompt,
            history,
            config: session.config().clone(),
        };
        debug!(session = %id, %token, "starting generation");
        spawn_generation(self.worker.clone(), request, session.token_watch());

        self.view.status(id, None);
        self.view.phase_changed(id, Phase::Sending);
        token
    }

    /// Invalidates the in-flight generation. Does nothing when idle.
    pub fn stop(&mut self, id: SessionId) -> bool {
        let session = self.session_mut(id);
        if !session.is_generating() {
            return false;
        }
        let token = session.bump_token();
        session.set_phase(Phase::Idle);
        session.push_notice(STOPPED_NOTICE, None);
        debug!(session = %id, %token, "generation stopped");

        self.view.status(id, None);
        self.view.phase_changed(id, Phase::Idle);
        self.notify_last_message(id);
        true
    }

    pub fn stop_all(&mut self) {
        for id in SessionId::ALL {
            self.stop(id);
        }
    }

    /// Clears both sessions and invalidates everything in flight.
    pub fn new_session(&mut self) {
        for id in SessionId::ALL {
            let session = self.session_mut(id);
            session.reset();
            session.push_notice(RESET_NOTICE, None);

            self.view.countdown(id, None);
            self.view.status(id, None);
            self.view.usage(id, TokenUsage::default());
            self.view.phase_changed(id, Phase::Idle);
            self.view.history_reset(id, self.sessions[id.index()].history());
        }
        info!("session reset");
    }

    /// Rewinds to before the last user turn and sends it again.
    pub fn regenerate(&mut self, id: SessionId) -> Regenerate {
        let session = self.session_mut(id);
        let Some(turn) = session.rewind_last_turn() else {
            return Regenerate::NothingToRegenerate;
        };
        let history = session.api_history();
        let prompt = turn
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        for message in turn {
            session.push(message);
        }
        self.view.history_reset(id, self.sessions[id.index()].history());
        Regenerate::Resubmitted(self.start_generation(id, prompt, history))
    }

    /// Switches whether `id` hands its responses to its peer.
    ///
    /// Switching off cancels the countdown this session armed on its peer
    /// and any countdown waiting to submit into this session.
    pub fn set_auto_reply(&mut self, id: SessionId, enabled: bool) {
        self.session(id).set_auto_reply(enabled);
        if enabled {
            return;
        }
        let peer = id.peer();
        let armed_here = self
            .session(peer)
            .pending_task()
            .is_some_and(|p| p.armed_by() == id);
        if armed_here {
            self.cancel_countdown(peer);
        }
        self.cancel_countdown(id);
    }

    fn cancel_countdown(&mut self, id: SessionId) {
        if self.session_mut(id).cancel_pending() {
            debug!(session = %id, "pending auto-reply cancelled");
            self.view.countdown(id, None);
        }
    }

    pub fn set_auto_reply_delay(&mut self, delay: impl Into<String>) {
        self.scheduler.set_delay(delay);
    }

    /// Hands `text` to `target`, now or after the configured delay.
    ///
    /// Any hand-off already pending on `target` is replaced.
    pub fn arm_auto_reply(&mut self, target: SessionId, text: String) -> Armed {
        let armed_by = target.peer();
        if !self.session(armed_by).auto_reply_enabled() {
            return Armed::Disabled;
        }
        if self.session_mut(target).cancel_pending() {
            self.view.countdown(target, None);
        }

        let guard = self.session(armed_by).auto_reply_flag();
        match self.scheduler.schedule(target, armed_by, text.clone(), guard) {
            Scheduled::Immediate { fallback_notice } => {
                if let Some(notice) = fallback_notice {
                    self.push_notice(target, notice, None);
                }
                match self.submit(target, &text) {
                    Some(token) => Armed::Sent(token),
                    None => Armed::Disabled,
                }
            }
            Scheduled::Countdown {
                pending,
                secs,
                notice,
            } => {
                let handoff = pending.id();
                self.session_mut(target).set_pending(pending);
                self.push_notice(target, notice, None);
                self.view.countdown(target, Some(secs));
                Armed::Countdown { handoff, secs }
            }
        }
    }

    /// Settings used from the session's next generation on.
    pub fn set_session_config(&mut self, id: SessionId, config: SessionConfig) {
        *self.session_mut(id).config_mut() = config;
    }

    /// Installs a loaded history, invalidating anything in flight.
    pub fn replace_history(&mut self, id: SessionId, history: Vec<Message>) {
        let token = self.session_mut(id).replace_history(history);
        debug!(session = %id, %token, "history replaced");
        self.view.status(id, None);
        self.view.phase_changed(id, Phase::Idle);
        self.view.history_reset(id, self.sessions[id.index()].history());
    }

    /// Applies every queued event. Returns how many were drained.
    pub fn poll(&mut self) -> usize {
        let events = self.queue.drain();
        let count = events.len();
        for event in events {
            self.apply(event);
        }
        count
    }

    /// Polls on the configured cadence until `cancel` fires or `step` breaks.
    ///
    /// `step` runs after every poll.
    pub async fn run_until<F>(&mut self, cancel: &CancellationToken, mut step: F)
    where
        F: FnMut(&mut Self) -> ControlFlow<()>,
    {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let drained = self.poll();
            if drained > 0 {
                debug!(drained, "applied events");
            }
            if step(self).is_break() {
                return;
            }
        }
    }

    pub fn apply(&mut self, event: Event) {
        let Event {
            seq,
            session: id,
            token,
            kind,
        } = event;
        let stale = kind.is_token_scoped() && !self.session(id).is_current(token);
        if stale && !kind.survives_stale_token() {
            debug!(session = %id, %token, event = kind.name(), "dropping stale event");
            return;
        }

        match kind {
            EventKind::StreamStart => {
                let session = self.session_mut(id);
                session.begin_stream(token);
                session.set_phase(Phase::Streaming);
                self.view.stream_started(id);
                self.view.phase_changed(id, Phase::Streaming);
            }
            EventKind::StreamChunk { text } => {
                if self.session_mut(id).append_chunk(token, &text) {
                    self.view.stream_chunk(id, &text);
                }
            }
            EventKind::StreamEnd { full_text, usage } => {
                self.finish_stream(id, token, full_text, usage, stale);
            }
            EventKind::StatusUpdate { text } => self.view.status(id, Some(&text)),
            EventKind::SystemNotice { text } => {
                self.push_notice(id, text, Some(seq));
                if !self.session(id).is_generating() {
                    self.view.phase_changed(id, Phase::Idle);
                }
            }
            EventKind::Error { text, fatal } => {
                error!(session = %id, %token, fatal, stale, "{text}");
                self.push_notice(id, text, Some(seq));
                if !stale {
                    let session = self.session_mut(id);
                    session.take_accumulator_for(token);
                    session.set_phase(Phase::Idle);
                    self.view.status(id, None);
                    self.view.phase_changed(id, Phase::Idle);
                }
            }
            EventKind::CredentialSwitched { credential_id } => {
                info!(session = %id, credential = %credential_id, "active credential switched");
                self.session_mut(id).config_mut().credential_id = Some(credential_id.clone());
                self.view.credential_changed(id, &credential_id);
            }
            EventKind::CountdownTick {
                handoff,
                remaining_secs,
            } => {
                if self.is_pending(id, handoff) {
                    self.view.countdown(id, Some(remaining_secs));
                }
            }
            EventKind::CountdownCancelled { handoff } => {
                if self.session_mut(id).take_pending_if(handoff).is_some() {
                    self.view.countdown(id, None);
                }
            }
            EventKind::AutoReplyDue { handoff, text } => {
                let Some(pending) = self.session_mut(id).take_pending_if(handoff) else {
                    debug!(session = %id, handoff, "ignoring superseded auto-reply");
                    return;
                };
                self.view.countdown(id, None);
                if self.session(pending.armed_by()).auto_reply_enabled() {
                    info!(session = %id, handoff, "auto-reply firing");
                    self.submit(id, &text);
                }
            }
        }
    }

    fn is_pending(&self, id: SessionId, handoff: u64) -> bool {
        self.session(id)
            .pending_task()
            .is_some_and(|p| p.id() == handoff)
    }

    fn finish_stream(
        &mut self,
        id: SessionId,
        token: GenerationToken,
        full_text: String,
        usage: Option<Usage>,
        stale: bool,
    ) {
        let accumulated = self.session_mut(id).take_accumulator_for(token);

        if stale {
            // Keep what was already on screen; never restart anything
            match accumulated.filter(|t| !t.trim().is_empty()) {
                Some(text) => self.commit_model_message(id, text),
                None => warn!(session = %id, %token, "dropping stale stream end"),
            }
            return;
        }

        let text = if full_text.is_empty() {
            accumulated.unwrap_or_default()
        } else {
            full_text
        };

        let session = self.session_mut(id);
        session.set_phase(Phase::Idle);
        let usage = usage.map(|u| session.record_usage(u));
        self.view.status(id, None);
        self.view.phase_changed(id, Phase::Idle);
        if let Some(usage) = usage {
            self.view.usage(id, usage);
        }

        if text.trim().is_empty() {
            debug!(session = %id, %token, "empty response, nothing to commit");
            return;
        }
        self.commit_model_message(id, text.clone());
        self.completed += 1;

        if self.session(id).auto_reply_enabled() {
            self.arm_auto_reply(id.peer(), text);
        }
    }

    fn commit_model_message(&mut self, id: SessionId, text: String) {
        let session = self.session_mut(id);
        let model = session.config().selected_model().map(str::to_string);
        session.push(Message::model(text, model));
        self.notify_last_message(id);
    }

    fn push_notice(&mut self, id: SessionId, text: String, source_seq: Option<u64>) {
        if self.session_mut(id).push_notice(text, source_seq) {
            self.notify_last_message(id);
        }
    }

    fn notify_last_message(&mut self, id: SessionId) {
        if let Some(message) = self.sessions[id.index()].history().last() {
            self.view.message_appended(id, message);
        }
    }
}
