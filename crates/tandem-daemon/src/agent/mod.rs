//! Agent session layer.
//!
//! [`AgentSession`] is the single authoritative conversation. It talks to the
//! agent through the [`backend`] traits; [`claude`] is the production backend.

pub mod backend;
pub mod claude;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod types;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod testing;

pub use backend::{AgentBackend, AttachedBackend, BackendClient, BackendSession};
pub use claude::{ClaudeBackend, PermissionStrategy};
pub use dispatch::{DispatchQueue, Dispatcher, InlineDispatcher, QueueDispatcher};
pub use error::AgentError;
pub use session::AgentSession;
pub use types::{
    AgentNotification, ConnectionState, HistoryEntry, SessionEvent, SessionOptions,
    SessionSnapshot, TurnOutput,
};
