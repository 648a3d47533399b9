//! Agent session data model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tandem_core::protocol::{ChatRole, SessionState};

/// Connection lifecycle of the agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectedIdle,
    SessionActive,
    Busy,
    Error,
}

impl ConnectionState {
    /// Whether a backend client is attached and healthy.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedIdle | Self::SessionActive | Self::Busy)
    }
}

/// One entry of the append-only conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Event emitted by a backend session while a turn runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ContentDelta(String),
    ContentComplete(String),
    ToolStarted { name: String },
    ToolCompleted { name: String, result: Option<String> },
    IntentChanged(String),
    TurnIdle,
    Error(String),
}

/// Options for creating or resuming a backend session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

/// Point-in-time view of the session, as replicated to bridge clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub is_busy: bool,
    pub current_intent: Option<String>,
}

impl SessionSnapshot {
    pub const fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub const fn is_session_active(&self) -> bool {
        self.session_id.is_some()
            && matches!(
                self.state,
                ConnectionState::SessionActive | ConnectionState::Busy
            )
    }

    /// Wire form sent to bridge clients.
    pub fn to_wire(&self) -> SessionState {
        SessionState {
            is_connected: self.is_connected(),
            is_session_active: self.is_session_active(),
            is_busy: self.is_busy,
            current_intent: self.current_intent.clone(),
        }
    }
}

/// Result of a successful turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutput {
    /// Last complete assistant message of the turn, or the streamed
    /// fragments when no complete message arrived.
    pub content: String,
}

/// Observable notification fanned out to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotification {
    StateChanged(SessionSnapshot),
    TurnStarted,
    TurnEnded,
    ContentDelta(String),
    ContentComplete(String),
    ToolStarted { name: String },
    ToolCompleted { name: String, result: Option<String> },
    IntentChanged(String),
    Error(String),
}
