//! Session relay pipeline: agent session ↔ bridge clients.
//!
//! Data flow:
//! ```text
//! AgentSession notifications → forwarder → BridgeServer broadcast
//! bridge sendPrompt / host stdin → prompt queue → worker → AgentSession::send_prompt
//! ```

use std::sync::Arc;

use tandem_core::protocol::ChatRole;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentNotification, AgentSession};
use crate::server::{BridgeServer, RemotePrompt};

/// Running relay tasks.
pub struct BridgeRelay {
    forwarder: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl BridgeRelay {
    /// Subscribe to `session` and start serving `prompts`.
    ///
    /// The worker is the only caller of `send_prompt`, so queued prompts run
    /// one at a time in arrival order.
    pub fn spawn(
        session: Arc<AgentSession>,
        server: Arc<BridgeServer>,
        prompts: mpsc::Receiver<RemotePrompt>,
    ) -> Self {
        let notifications = session.subscribe();
        let forwarder = tokio::spawn(forward_notifications(
            notifications,
            Arc::clone(&session),
            Arc::clone(&server),
        ));
        let worker = tokio::spawn(run_prompts(prompts, session, server));
        Self { forwarder, worker }
    }

    /// Whether the prompt worker is still consuming.
    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    pub async fn shutdown(self) {
        self.worker.abort();
        self.forwarder.abort();
        let _ = self.worker.await;
        let _ = self.forwarder.await;
        debug!("Relay stopped");
    }
}

async fn forward_notifications(
    mut rx: broadcast::Receiver<AgentNotification>,
    session: Arc<AgentSession>,
    server: Arc<BridgeServer>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => forward(&server, &session, notification).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Relay lagged behind session notifications");
                server.broadcast_state(&session.snapshot()).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Notification forwarder finished");
}

async fn forward(server: &BridgeServer, session: &AgentSession, notification: AgentNotification) {
    match notification {
        AgentNotification::StateChanged(snapshot) => {
            server.broadcast_state(&snapshot).await;
        }
        // Each of these is followed by a StateChanged carrying the result.
        AgentNotification::TurnStarted
        | AgentNotification::TurnEnded
        | AgentNotification::IntentChanged(_) => {}
        AgentNotification::ContentDelta(text) => {
            server.broadcast_chat_delta(text).await;
        }
        AgentNotification::ContentComplete(text) => {
            server.broadcast_chat(ChatRole::Assistant, text, false).await;
        }
        AgentNotification::ToolStarted { name } => {
            server.broadcast_tool_event(name, true, None).await;
        }
        AgentNotification::ToolCompleted { name, result } => {
            server.broadcast_tool_event(name, false, result).await;
        }
        AgentNotification::Error(message) => {
            server.broadcast_chat(ChatRole::System, message, false).await;
            server.broadcast_state(&session.snapshot()).await;
        }
    }
}

async fn run_prompts(
    mut prompts: mpsc::Receiver<RemotePrompt>,
    session: Arc<AgentSession>,
    server: Arc<BridgeServer>,
) {
    while let Some(RemotePrompt {
        connection_id,
        prompt,
    }) = prompts.recv().await
    {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            debug!(?connection_id, "Ignoring empty prompt");
            continue;
        }

        info!(?connection_id, len = prompt.len(), "Running prompt");
        server.broadcast_chat(ChatRole::User, prompt, false).await;
        match session.send_prompt(prompt).await {
            Ok(output) => debug!(len = output.content.len(), "Turn finished"),
            // Already surfaced through the session's error notification.
            Err(AgentError::Turn(message)) => warn!(message, "Turn failed"),
            Err(e) => {
                warn!(error = %e, "Prompt rejected");
                server
                    .broadcast_chat(ChatRole::System, format!("Prompt failed: {e}"), false)
                    .await;
            }
        }
    }
    debug!("Prompt queue closed");
}
