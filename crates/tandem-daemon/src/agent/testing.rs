//! Scripted in-memory backend for session and relay tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::backend::{AgentBackend, AttachedBackend, BackendClient, BackendSession};
use super::error::AgentError;
use super::types::{SessionEvent, SessionOptions};

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

#[derive(Default)]
struct FakeState {
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
    created: AtomicUsize,
    stopped: AtomicUsize,
    replies: Mutex<VecDeque<Vec<SessionEvent>>>,
    prompts: Mutex<Vec<String>>,
    senders: Mutex<Vec<Option<mpsc::Sender<SessionEvent>>>>,
    disposed: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn fail_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_send(&self) {
        self.state.fail_send.store(true, Ordering::SeqCst);
    }

    /// Queue the events emitted in response to the next prompt.
    pub fn reply_with(&self, events: Vec<SessionEvent>) {
        self.state.replies.lock().unwrap().push_back(events);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub fn disposed(&self) -> Vec<String> {
        self.state.disposed.lock().unwrap().clone()
    }

    pub fn stopped_clients(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Event sender of the `index`-th attached session.
    pub fn sender(&self, index: usize) -> mpsc::Sender<SessionEvent> {
        self.state.senders.lock().unwrap()[index].clone().unwrap()
    }

    pub async fn emit(&self, index: usize, event: SessionEvent) {
        self.sender(index).send(event).await.unwrap();
    }

    /// Drop the event stream of the `index`-th session.
    pub fn close(&self, index: usize) {
        self.state.senders.lock().unwrap()[index] = None;
    }
}

#[async_trait]
impl AgentBackend for FakeBackend {
    async fn connect(
        &self,
        _working_directory: Option<&Path>,
    ) -> Result<Box<dyn BackendClient>, AgentError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::BackendUnavailable("fake backend offline".into()));
        }
        Ok(Box::new(FakeClient {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeClient {
    state: Arc<FakeState>,
}

impl FakeClient {
    fn attach(&self, session_id: String) -> AttachedBackend {
        let (tx, rx) = mpsc::channel(64);
        let mut senders = self.state.senders.lock().unwrap();
        let index = senders.len();
        senders.push(Some(tx));
        AttachedBackend {
            session: Arc::new(FakeSession {
                id: session_id,
                index,
                state: Arc::clone(&self.state),
            }),
            events: rx,
        }
    }
}

#[async_trait]
impl BackendClient for FakeClient {
    async fn create_session(
        &self,
        _options: &SessionOptions,
    ) -> Result<AttachedBackend, AgentError> {
        let n = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.attach(format!("fake-{n}")))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        _options: &SessionOptions,
    ) -> Result<AttachedBackend, AgentError> {
        Ok(self.attach(session_id.to_string()))
    }

    async fn stop(&self) {
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeSession {
    id: String,
    index: usize,
    state: Arc<FakeState>,
}

#[async_trait]
impl BackendSession for FakeSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, prompt: &str) -> Result<(), AgentError> {
        if self.state.fail_send.load(Ordering::SeqCst) {
            return Err(AgentError::Transport("fake stdin closed".into()));
        }
        self.state.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self.state.replies.lock().unwrap().pop_front();
        let sender = self.state.senders.lock().unwrap()[self.index].clone();
        if let (Some(events), Some(tx)) = (reply, sender) {
            for event in events {
                let _ = tx.send(event).await;
            }
        }
        Ok(())
    }

    async fn dispose(&self) {
        self.state.disposed.lock().unwrap().push(self.id.clone());
    }
}
