//! Scripted provider for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;

use crate::providers::{
    ChatMessage, ProviderClient, ProviderError, ProviderKind, ProviderRequest, ProviderResult,
    ProviderStream, StreamEvent, Usage,
};

/// What one `send` call does.
pub(crate) enum Script {
    /// Opens a stream that yields these events and ends.
    Events(Vec<ProviderResult<StreamEvent>>),
    /// Fails before any stream is opened.
    Fail(ProviderError),
    /// Stream fed by the test through a channel; ends when the sender drops.
    Channel(mpsc::UnboundedReceiver<ProviderResult<StreamEvent>>),
    /// Opens a stream that never yields.
    Silent,
    /// Never opens a stream at all.
    Hang,
}

impl Script {
    pub(crate) fn reply(chunks: &[&str]) -> Self {
        Script::Events(
            chunks
                .iter()
                .map(|c| Ok(StreamEvent::TextDelta { text: (*c).to_string() }))
                .collect(),
        )
    }

    pub(crate) fn reply_with_usage(chunks: &[&str], usage: Usage) -> Self {
        let Script::Events(mut events) = Self::reply(chunks) else {
            unreachable!()
        };
        events.push(Ok(StreamEvent::Usage(usage)));
        Script::Events(events)
    }

    /// A channel-driven script and its sender.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedSender<ProviderResult<StreamEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Script::Channel(rx), tx)
    }
}

/// One observed `send` call.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub credential: Option<String>,
    pub prompt: String,
    pub history: Vec<ChatMessage>,
    pub model: String,
}

/// Replays queued scripts, per credential id or from a shared queue.
///
/// With nothing queued a call returns an empty successful stream.
pub(crate) struct ScriptedProvider {
    kind: ProviderKind,
    by_credential: Mutex<HashMap<String, VecDeque<Script>>>,
    shared: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub(crate) fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            by_credential: Mutex::new(HashMap::new()),
            shared: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, script: Script) {
        self.shared.lock().unwrap().push_back(script);
    }

    pub(crate) fn push_for(&self, credential_id: &str, script: Script) {
        self.by_credential
            .lock()
            .unwrap()
            .entry(credential_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_script(&self, credential: Option<&str>) -> Option<Script> {
        if let Some(id) = credential
            && let Some(script) = self
                .by_credential
                .lock()
                .unwrap()
                .get_mut(id)
                .and_then(VecDeque::pop_front)
        {
            return Some(script);
        }
        self.shared.lock().unwrap().pop_front()
    }
}

impl ProviderClient for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn send<'a>(&'a self, request: &'a ProviderRequest) -> BoxFuture<'a, ProviderResult<ProviderStream>> {
        let credential = request.credential.as_ref().map(|c| c.id().to_string());
        self.calls.lock().unwrap().push(RecordedCall {
            credential: credential.clone(),
            prompt: request.prompt.clone(),
            history: request.history.clone(),
            model: request.model.clone(),
        });
        let script = self.next_script(credential.as_deref());

        Box::pin(async move {
            match script {
                None => Ok(stream::empty().boxed()),
                Some(Script::Events(events)) => Ok(stream::iter(events).boxed()),
                Some(Script::Fail(err)) => Err(err),
                Some(Script::Channel(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()),
                Some(Script::Silent) => Ok(stream::pending().boxed()),
                Some(Script::Hang) => std::future::pending().await,
            }
        })
    }
}
