//! Background task that runs one generation and reports it as events.
//!
//! The worker never touches session state. It reads the session's token
//! through a [`TokenWatch`] and stops silently once the token moves on.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info_span, warn};

use super::events::{EventKind, SessionId};
use super::failover::{self, FailoverCoordinator};
use super::queue::EventSender;
use super::retry::{RetryError, RetryPolicy};
use super::token::{GenerationToken, TokenWatch};
use crate::config::{Config, SessionConfig};
use crate::credentials::Credential;
use crate::providers::{
    ChatMessage, ErrorClass, ProviderClient, ProviderError, ProviderKind, ProviderRegistry,
    ProviderRequest, ProviderResult, ProviderStream, StreamEvent, Usage,
};

/// How often a silent stream is interrupted to re-check the token.
const STREAM_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Input for one generation, snapshotted by the dispatcher.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub session: SessionId,
    pub token: GenerationToken,
    pub prompt: String,
    /// Provider history before `prompt`.
    pub history: Vec<ChatMessage>,
    pub config: SessionConfig,
}

/// Shared, read-only collaborators for every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<ProviderRegistry>,
    pub retry: RetryPolicy,
    pub stall_timeout: Duration,
    pub events: EventSender,
}

impl WorkerContext {
    pub fn from_config(config: &Config, registry: Arc<ProviderRegistry>, events: EventSender) -> Self {
        Self {
            registry,
            retry: RetryPolicy::from_config(&config.retry),
            stall_timeout: config.stream_idle_timeout(),
            events,
        }
    }
}

pub fn spawn_generation(ctx: WorkerContext, request: GenerationRequest, watch: TokenWatch) -> JoinHandle<()> {
    let span = info_span!("generation", session = %request.session, token = %request.token);
    tokio::spawn(run_generation(ctx, request, watch).instrument(span))
}

enum Outcome {
    Completed { text: String, usage: Option<Usage> },
    Failed(ProviderError),
    Cancelled,
}

/// Emits events for `request` until it completes, fails or goes stale.
pub async fn run_generation(ctx: WorkerContext, request: GenerationRequest, watch: TokenWatch) {
    let GenerationRequest {
        session,
        token,
        prompt,
        history,
        config,
    } = request;
    let emit = |kind: EventKind| {
        ctx.events.send(session, token, kind);
    };

    let resolved = config
        .provider
        .as_deref()
        .and_then(ProviderKind::from_id)
        .and_then(|kind| Some((kind, ctx.registry.client(kind)?)))
        .zip(config.selected_model());
    let Some(((kind, client), model)) = resolved else {
        debug!("generation rejected: provider or model not set");
        emit(EventKind::Error {
            text: format!("Select a provider and model for session {session}."),
            fatal: true,
        });
        return;
    };

    let mut failover = ctx.registry.pool(kind).map(FailoverCoordinator::new);
    let mut credential = match failover.as_mut() {
        Some(coordinator) => match coordinator.initial(config.credential_id.as_deref()) {
            Some(credential) => Some(credential),
            None => {
                emit(EventKind::Error {
                    text: format!("No credentials configured for {kind}."),
                    fatal: true,
                });
                return;
            }
        },
        None => None,
    };

    let mut provider_request = ProviderRequest {
        session,
        model: model.to_string(),
        system_prompt: config.system_prompt().map(str::to_string),
        temperature: config.clamped_temperature(),
        history,
        prompt,
        credential: None,
    };

    loop {
        provider_request.credential.clone_from(&credential);
        let outcome = attempt(&ctx, client.as_ref(), &provider_request, &watch, token).await;

        let err = match outcome {
            Outcome::Completed { text, usage } => {
                debug!(chars = text.len(), "generation complete");
                emit(EventKind::StreamEnd {
                    full_text: text,
                    usage,
                });
                return;
            }
            Outcome::Cancelled => {
                debug!("generation abandoned: token is stale");
                return;
            }
            Outcome::Failed(err) => err,
        };

        if err.class() == ErrorClass::CredentialExhausted
            && let (Some(coordinator), Some(current)) = (failover.as_mut(), credential.as_ref())
        {
            match coordinator.next_after_failure(current) {
                Some(next) => {
                    emit(EventKind::SystemNotice {
                        text: failover::switch_notice(current, &next),
                    });
                    emit(EventKind::CredentialSwitched {
                        credential_id: next.id().to_string(),
                    });
                    credential = Some(next);
                    continue;
                }
                None => {
                    error!(tried = coordinator.attempts(), "failover exhausted: {err}");
                    emit(EventKind::Error {
                        text: failover::exhausted_message(&err),
                        fatal: true,
                    });
                    return;
                }
            }
        }

        error!(kind = %err.kind, "generation failed: {err}");
        emit(EventKind::Error {
            text: err.to_string(),
            fatal: true,
        });
        return;
    }
}

/// One call on one credential: open the stream (with retries) and consume it.
async fn attempt(
    ctx: &WorkerContext,
    client: &dyn ProviderClient,
    request: &ProviderRequest,
    watch: &TokenWatch,
    token: GenerationToken,
) -> Outcome {
    let credential = request.credential.as_deref().map(Credential::id);
    debug!(credential, "opening provider stream");

    let opened = ctx
        .retry
        .run(
            |_attempt| open_stream(ctx, client, request, watch, token),
            || !watch.is_current(token),
            |status| {
                ctx.events.send(
                    request.session,
                    token,
                    EventKind::StatusUpdate {
                        text: status.to_string(),
                    },
                );
            },
        )
        .await;

    let stream = match opened {
        Ok(Some(stream)) => stream,
        Ok(None) | Err(RetryError::Cancelled) => return Outcome::Cancelled,
        Err(RetryError::Failed(err)) => return Outcome::Failed(err),
    };
    if !watch.is_current(token) {
        return Outcome::Cancelled;
    }

    ctx.events.send(request.session, token, EventKind::StreamStart);
    consume_stream(ctx, stream, request.session, watch, token).await
}

/// Waits for `send` to open a stream, re-checking the token between slices.
///
/// `None` means the token moved on first. Waiting longer than the stall
/// timeout fails with a retryable timeout.
async fn open_stream(
    ctx: &WorkerContext,
    client: &dyn ProviderClient,
    request: &ProviderRequest,
    watch: &TokenWatch,
    token: GenerationToken,
) -> ProviderResult<Option<ProviderStream>> {
    let mut send = client.send(request);
    let mut waited = Duration::ZERO;
    loop {
        match timeout(STREAM_POLL_TIMEOUT, &mut send).await {
            Ok(result) => return result.map(Some),
            Err(_) => {
                if !watch.is_current(token) {
                    return Ok(None);
                }
                waited += STREAM_POLL_TIMEOUT;
                if waited >= ctx.stall_timeout {
                    warn!(waited = ?waited, "provider did not open a stream");
                    return Err(ProviderError::timeout(format!(
                        "No response from provider for {}s",
                        waited.as_secs()
                    )));
                }
            }
        }
    }
}

async fn consume_stream(
    ctx: &WorkerContext,
    mut stream: ProviderStream,
    session: SessionId,
    watch: &TokenWatch,
    token: GenerationToken,
) -> Outcome {
    let mut text = String::new();
    let mut usage = None;
    let mut idle = Duration::ZERO;

    loop {
        if !watch.is_current(token) {
            return Outcome::Cancelled;
        }
        let event = match timeout(STREAM_POLL_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(event))) => event,
            Ok(Some(Err(err))) => return Outcome::Failed(err),
            Ok(None) => return Outcome::Completed { text, usage },
            Err(_) => {
                idle += STREAM_POLL_TIMEOUT;
                if idle >= ctx.stall_timeout {
                    warn!(idle = ?idle, "provider stream stalled");
                    return Outcome::Failed(ProviderError::timeout(format!(
                        "No response from provider for {}s",
                        idle.as_secs()
                    )));
                }
                continue;
            }
        };
        idle = Duration::ZERO;

        // Chunks received after a stop are discarded
        if !watch.is_current(token) {
            return Outcome::Cancelled;
        }
        match event {
            StreamEvent::TextDelta { text: delta } if !delta.is_empty() => {
                text.push_str(&delta);
                ctx.events.send(session, token, EventKind::StreamChunk { text: delta });
            }
            StreamEvent::TextDelta { .. } => {}
            StreamEvent::Status { text: status } => {
                ctx.events.send(session, token, EventKind::StatusUpdate { text: status });
            }
            StreamEvent::Usage(reported) => usage = Some(reported),
        }
    }
}
