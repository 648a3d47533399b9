//! Agent session errors.

/// Errors surfaced by [`super::AgentSession`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("not connected to the agent backend")]
    NotConnected,

    #[error("no active session")]
    NoActiveSession,

    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("turn failed: {0}")]
    Turn(String),

    #[error("agent transport error: {0}")]
    Transport(String),
}
