//! Seams between the session and a concrete agent implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::AgentError;
use super::types::{SessionEvent, SessionOptions};

/// Factory for backend clients.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Locate and start the agent. Fails with [`AgentError::BackendUnavailable`].
    async fn connect(
        &self,
        working_directory: Option<&Path>,
    ) -> Result<Box<dyn BackendClient>, AgentError>;
}

/// A connected agent able to host sessions.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn create_session(&self, options: &SessionOptions) -> Result<AttachedBackend, AgentError>;

    async fn resume_session(
        &self,
        session_id: &str,
        options: &SessionOptions,
    ) -> Result<AttachedBackend, AgentError>;

    async fn stop(&self);
}

/// Handle to one backend conversation.
#[async_trait]
pub trait BackendSession: Send + Sync {
    fn session_id(&self) -> &str;

    /// Submit a prompt. Events for the turn arrive on the session's stream.
    async fn send(&self, prompt: &str) -> Result<(), AgentError>;

    async fn dispose(&self);
}

/// A freshly attached session and its event stream.
///
/// The stream closing means the backend is gone.
pub struct AttachedBackend {
    pub session: Arc<dyn BackendSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

impl std::fmt::Debug for AttachedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedBackend")
            .field("session_id", &self.session.session_id())
            .finish_non_exhaustive()
    }
}
