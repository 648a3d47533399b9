//! The authoritative agent session.
//!
//! Owns the backend client and the attached backend session, translates the
//! backend event stream into history and notifications, and enforces that a
//! single prompt is outstanding at a time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tandem_core::protocol::ChatRole;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{AgentBackend, AttachedBackend, BackendClient, BackendSession};
use super::dispatch::{Dispatcher, InlineDispatcher};
use super::error::AgentError;
use super::types::{
    AgentNotification, ConnectionState, HistoryEntry, SessionEvent, SessionOptions,
    SessionSnapshot, TurnOutput,
};

const NOTIFICATION_CAPACITY: usize = 1024;

type TurnResolution = Result<TurnOutput, String>;

/// Single conversation hosted by this process.
pub struct AgentSession {
    backend: Arc<dyn AgentBackend>,
    default_model: String,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

struct Shared {
    data: Mutex<SessionData>,
    notify_tx: broadcast::Sender<AgentNotification>,
    dispatcher: Arc<dyn Dispatcher>,
}

#[derive(Default)]
struct SessionData {
    state: ConnectionState,
    session_id: Option<String>,
    model: Option<String>,
    working_directory: Option<PathBuf>,
    current_intent: Option<String>,
    busy: bool,
    /// The caller stopped waiting but the backend turn is still running.
    abandoned: bool,
    /// Bumped on every detach; events tagged with an older value are dropped.
    generation: u64,
    pending: Option<oneshot::Sender<TurnResolution>>,
    buffer: String,
    last_complete: Option<String>,
    history: Vec<HistoryEntry>,
}

#[derive(Default)]
struct Lifecycle {
    client: Option<Box<dyn BackendClient>>,
    attached: Option<Attached>,
}

struct Attached {
    handle: Arc<dyn BackendSession>,
    pump: JoinHandle<()>,
}

impl AgentSession {
    /// Create a disconnected session delivering notifications inline.
    pub fn new(backend: Arc<dyn AgentBackend>, default_model: impl Into<String>) -> Self {
        Self::with_dispatcher(backend, default_model, Arc::new(InlineDispatcher))
    }

    pub fn with_dispatcher(
        backend: Arc<dyn AgentBackend>,
        default_model: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            backend,
            default_model: default_model.into(),
            shared: Arc::new(Shared {
                data: Mutex::new(SessionData::default()),
                notify_tx,
                dispatcher,
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        }
    }

    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentNotification> {
        self.shared.notify_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.data().snapshot()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.data().history.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.data().session_id.clone()
    }

    /// Connect to the backend, replacing any existing client and session.
    pub async fn connect(&self, working_directory: Option<PathBuf>) -> Result<(), AgentError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.teardown(&mut lifecycle).await;

        let snapshot = {
            let mut data = self.shared.data();
            data.state = ConnectionState::Connecting;
            data.working_directory.clone_from(&working_directory);
            data.snapshot()
        };
        self.shared.notify(AgentNotification::StateChanged(snapshot));

        match self.backend.connect(working_directory.as_deref()).await {
            Ok(client) => {
                lifecycle.client = Some(client);
                info!(working_directory = ?working_directory, "Connected to agent backend");
                self.shared.set_state(ConnectionState::ConnectedIdle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to agent backend");
                self.shared.fail(&e.to_string());
                Err(e)
            }
        }
    }

    /// Create a fresh backend session, disposing the current one first.
    pub async fn create_session(&self, options: SessionOptions) -> Result<String, AgentError> {
        self.attach_with(options, None).await
    }

    /// Resume an existing backend session, disposing the current one first.
    pub async fn resume_session(
        &self,
        session_id: &str,
        model: Option<String>,
    ) -> Result<String, AgentError> {
        let options = SessionOptions {
            model,
            system_prompt: None,
        };
        self.attach_with(options, Some(session_id)).await
    }

    async fn attach_with(
        &self,
        mut options: SessionOptions,
        resume: Option<&str>,
    ) -> Result<String, AgentError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.client.is_none() {
            return Err(AgentError::NotConnected);
        }
        self.detach(&mut lifecycle).await;

        let model = options
            .model
            .get_or_insert_with(|| self.default_model.clone())
            .clone();
        let Some(client) = lifecycle.client.as_ref() else {
            return Err(AgentError::NotConnected);
        };
        let attached = match resume {
            Some(id) => client.resume_session(id, &options).await,
            None => client.create_session(&options).await,
        };
        let AttachedBackend { session, events } = match attached {
            Ok(attached) => attached,
            Err(e) => {
                warn!(error = %e, resume = ?resume, "Failed to attach backend session");
                self.shared.fail(&e.to_string());
                return Err(e);
            }
        };

        let session_id = session.session_id().to_string();
        let (generation, snapshot) = {
            let mut data = self.shared.data();
            data.session_id = Some(session_id.clone());
            data.model = Some(model.clone());
            data.state = ConnectionState::SessionActive;
            (data.generation, data.snapshot())
        };
        let pump = tokio::spawn(pump_events(Arc::clone(&self.shared), generation, events));
        lifecycle.attached = Some(Attached {
            handle: session,
            pump,
        });
        drop(lifecycle);

        info!(session_id, model, resumed = resume.is_some(), "Session attached");
        self.shared.notify(AgentNotification::StateChanged(snapshot));
        Ok(session_id)
    }

    /// Submit a prompt and wait for the turn to finish.
    ///
    /// Only one prompt may be outstanding; a concurrent call is rejected with
    /// [`AgentError::TurnInProgress`] and leaves history untouched.
    pub async fn send_prompt(&self, text: &str) -> Result<TurnOutput, AgentError> {
        let (handle, done_rx, generation, snapshot) = {
            let lifecycle = self.lifecycle.lock().await;
            let handle = lifecycle
                .attached
                .as_ref()
                .map(|a| Arc::clone(&a.handle))
                .ok_or(AgentError::NoActiveSession)?;

            let mut data = self.shared.data();
            if data.busy {
                return Err(AgentError::TurnInProgress);
            }
            let (done_tx, done_rx) = oneshot::channel();
            data.pending = Some(done_tx);
            data.busy = true;
            data.state = ConnectionState::Busy;
            data.buffer.clear();
            data.last_complete = None;
            data.history.push(HistoryEntry::now(ChatRole::User, text));
            (handle, done_rx, data.generation, data.snapshot())
        };

        let mut turn = TurnGuard {
            shared: Arc::clone(&self.shared),
            generation,
            submitted: true,
        };
        self.shared.notify(AgentNotification::TurnStarted);
        self.shared.notify(AgentNotification::StateChanged(snapshot));
        debug!(session_id = handle.session_id(), "Prompt submitted");

        if let Err(e) = handle.send(text).await {
            turn.submitted = false;
            return Err(e);
        }

        match done_rx.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(AgentError::Turn(message)),
            Err(_) => Err(AgentError::Turn("turn abandoned".to_string())),
        }
    }

    /// Dispose the session and the backend client.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.teardown(&mut lifecycle).await;
        drop(lifecycle);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        self.detach(lifecycle).await;
        if let Some(client) = lifecycle.client.take() {
            client.stop().await;
        }
    }

    /// Release the attached session: event subscription first, then the
    /// backend handle.
    async fn detach(&self, lifecycle: &mut Lifecycle) {
        if let Some(attached) = lifecycle.attached.take() {
            attached.pump.abort();
            let _ = attached.pump.await;
            attached.handle.dispose().await;
            debug!(session_id = attached.handle.session_id(), "Session disposed");
        }

        let pending = {
            let mut data = self.shared.data();
            data.generation += 1;
            data.session_id = None;
            data.current_intent = None;
            data.buffer.clear();
            data.last_complete = None;
            if data.abandoned {
                data.finish_turn();
            }
            data.pending.take()
        };
        if let Some(done_tx) = pending {
            let _ = done_tx.send(Err("session replaced".to_string()));
        }
    }
}

impl Shared {
    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notification: AgentNotification) {
        let tx = self.notify_tx.clone();
        self.dispatcher.post(Box::new(move || {
            let _ = tx.send(notification);
        }));
    }

    fn set_state(&self, state: ConnectionState) {
        let snapshot = {
            let mut data = self.data();
            data.state = state;
            data.snapshot()
        };
        self.notify(AgentNotification::StateChanged(snapshot));
    }

    fn fail(&self, message: &str) {
        self.notify(AgentNotification::Error(message.to_string()));
        self.set_state(ConnectionState::Error);
    }

    /// Apply one backend event. Returns `false` once the pump is stale.
    fn handle_event(&self, generation: u64, event: SessionEvent) -> bool {
        let mut notifications = Vec::with_capacity(2);
        let resolution = {
            let mut data = self.data();
            if data.generation != generation {
                return false;
            }
            match event {
                SessionEvent::ContentDelta(text) => {
                    data.buffer.push_str(&text);
                    notifications.push(AgentNotification::ContentDelta(text));
                    None
                }
                SessionEvent::ContentComplete(text) => {
                    data.buffer.clear();
                    data.history
                        .push(HistoryEntry::now(ChatRole::Assistant, text.clone()));
                    data.last_complete = Some(text.clone());
                    notifications.push(AgentNotification::ContentComplete(text));
                    None
                }
                SessionEvent::ToolStarted { name } => {
                    notifications.push(AgentNotification::ToolStarted { name });
                    None
                }
                SessionEvent::ToolCompleted { name, result } => {
                    notifications.push(AgentNotification::ToolCompleted { name, result });
                    None
                }
                SessionEvent::IntentChanged(label) => {
                    data.current_intent = Some(label.clone());
                    notifications.push(AgentNotification::IntentChanged(label));
                    notifications.push(AgentNotification::StateChanged(data.snapshot()));
                    None
                }
                SessionEvent::TurnIdle => {
                    let buffered = std::mem::take(&mut data.buffer);
                    let content = data.last_complete.take().unwrap_or(buffered);
                    data.end_abandoned_turn(&mut notifications);
                    data.pending.take().map(|tx| (tx, Ok(TurnOutput { content })))
                }
                SessionEvent::Error(message) => {
                    data.buffer.clear();
                    data.last_complete = None;
                    data.history
                        .push(HistoryEntry::now(ChatRole::System, message.clone()));
                    notifications.push(AgentNotification::Error(message.clone()));
                    data.end_abandoned_turn(&mut notifications);
                    data.pending.take().map(|tx| (tx, Err(message)))
                }
            }
        };

        for notification in notifications {
            self.notify(notification);
        }
        if let Some((done_tx, result)) = resolution {
            let _ = done_tx.send(result);
        }
        true
    }

    /// The backend stream ended without the session being replaced.
    fn backend_closed(&self, generation: u64) {
        let pending = {
            let mut data = self.data();
            if data.generation != generation {
                return;
            }
            if data.abandoned {
                data.finish_turn();
            }
            data.pending.take()
        };
        warn!("Agent backend event stream closed");
        let message = "agent backend closed".to_string();
        if let Some(done_tx) = pending {
            let _ = done_tx.send(Err(message.clone()));
        }
        self.fail(&message);
    }
}

impl SessionData {
    fn finish_turn(&mut self) {
        self.busy = false;
        self.abandoned = false;
        if self.state == ConnectionState::Busy {
            self.state = ConnectionState::SessionActive;
        }
    }

    /// Close out a turn whose caller went away once the backend reports it
    /// finished.
    fn end_abandoned_turn(&mut self, notifications: &mut Vec<AgentNotification>) {
        if self.abandoned {
            self.finish_turn();
            debug!("Abandoned turn finished");
            notifications.push(AgentNotification::TurnEnded);
            notifications.push(AgentNotification::StateChanged(self.snapshot()));
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            model: self.model.clone(),
            working_directory: self.working_directory.clone(),
            is_busy: self.busy,
            current_intent: self.current_intent.clone(),
        }
    }
}

async fn pump_events(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        if !shared.handle_event(generation, event) {
            return;
        }
    }
    shared.backend_closed(generation);
}

/// Ends the turn on every exit path of `send_prompt`.
///
/// When the caller is cancelled while the backend still runs the turn, the
/// session stays busy until the backend's terminal event arrives.
struct TurnGuard {
    shared: Arc<Shared>,
    generation: u64,
    submitted: bool,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let snapshot = {
            let mut data = self.shared.data();
            if data.generation != self.generation {
                data.busy = false;
            } else if self.submitted && data.pending.take().is_some() {
                data.abandoned = true;
                debug!("Prompt caller went away, waiting for the turn to finish");
                return;
            } else {
                data.finish_turn();
            }
            data.snapshot()
        };
        self.shared.notify(AgentNotification::TurnEnded);
        self.shared.notify(AgentNotification::StateChanged(snapshot));
    }
}
