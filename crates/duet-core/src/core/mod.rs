//! Generation orchestration: tokens, events, workers and the dispatcher.

pub mod autoreply;
pub mod dispatcher;
pub mod events;
pub mod failover;
pub mod interrupt;
pub mod queue;
pub mod retry;
pub mod session;
pub mod token;
pub mod ui;
pub mod worker;

pub use dispatcher::{Armed, Dispatcher, Regenerate};
pub use events::{Event, EventKind, SessionId};
pub use session::{Message, Phase, Role, SessionState, TokenUsage};
pub use token::GenerationToken;
pub use ui::{NullView, SessionView};
