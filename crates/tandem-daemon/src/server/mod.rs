//! WebSocket bridge server.
//!
//! Accepts remote clients on one port, fans session updates out to all of
//! them, and forwards their `sendPrompt` requests to the prompt queue.

mod config;
mod connection;
mod registry;

pub use config::ServerConfig;
pub use registry::ClientRegistry;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::routing::any;
use tandem_core::protocol::{self, BridgeMessage, ChatRole};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::SessionSnapshot;
use connection::PeerContext;

/// Server errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind bridge port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge server already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A prompt queued for the host session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePrompt {
    /// Submitting bridge connection; `None` for prompts typed on the host.
    pub connection_id: Option<Uuid>,
    pub prompt: String,
}

impl RemotePrompt {
    pub fn local(prompt: impl Into<String>) -> Self {
        Self {
            connection_id: None,
            prompt: prompt.into(),
        }
    }
}

struct Shared {
    config: ServerConfig,
    registry: ClientRegistry,
    prompt_tx: mpsc::Sender<RemotePrompt>,
    /// Encoded `sessionState` most recently broadcast.
    last_state: RwLock<Option<String>>,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    serve: JoinHandle<()>,
}

/// Bridge server handle.
pub struct BridgeServer {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl BridgeServer {
    pub fn new(config: ServerConfig, prompt_tx: mpsc::Sender<RemotePrompt>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: ClientRegistry::new(),
                prompt_tx,
                last_state: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Bind `port` on every interface, falling back to loopback, and start
    /// accepting clients. Port 0 picks a free port.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, BridgeError> {
        if let Some(addr) = self.local_addr() {
            return Err(BridgeError::AlreadyRunning(addr));
        }

        let listener = bind(port).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let app = Router::new()
            .route("/", any(connection::upgrade))
            .fallback(connection::upgrade)
            .with_state(PeerContext {
                shared: Arc::clone(&self.shared),
                shutdown: shutdown.clone(),
                tracker: tracker.clone(),
            });

        let signal = shutdown.clone().cancelled_owned();
        let serve = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %e, "Bridge server failed");
            }
        });

        info!(%addr, "Bridge server listening");
        *self.running_slot() = Some(Running {
            addr,
            shutdown,
            tracker,
            serve,
        });
        Ok(addr)
    }

    /// Stop accepting, close every connection, and clear the registry.
    pub async fn stop(&self) {
        let Some(running) = self.running_slot().take() else {
            return;
        };
        info!(addr = %running.addr, "Stopping bridge server");

        running.shutdown.cancel();
        running.tracker.close();
        let budget = connection::stop_budget(self.shared.config.close_timeout);
        if tokio::time::timeout(budget, running.tracker.wait()).await.is_err() {
            warn!("Bridge connections did not close in time");
        }

        let serve = running.serve;
        let abort = serve.abort_handle();
        if tokio::time::timeout(budget, serve).await.is_err() {
            abort.abort();
        }
        self.shared.registry.clear().await;
        debug!("Bridge server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running_slot().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running_slot().as_ref().map(|r| r.addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.registry.len().await
    }

    /// Send `message` to every connected client. Returns how many accepted it.
    pub async fn broadcast(&self, message: &BridgeMessage) -> usize {
        match protocol::encode(message) {
            Ok(frame) => self.shared.registry.broadcast(&frame).await,
            Err(e) => {
                error!(error = %e, msg_type = message.type_name(), "Failed to encode broadcast");
                0
            }
        }
    }

    /// Replicate the session state. Also remembered for clients that connect
    /// later.
    pub async fn broadcast_state(&self, snapshot: &SessionSnapshot) -> usize {
        let message = BridgeMessage::state(snapshot.to_wire());
        let frame = match protocol::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode session state");
                return 0;
            }
        };
        let mut last_state = self.shared.last_state.write().await;
        *last_state = Some(frame.clone());
        let delivered = self.shared.registry.broadcast(&frame).await;
        drop(last_state);
        delivered
    }

    pub async fn broadcast_chat(
        &self,
        role: ChatRole,
        content: impl Into<String>,
        is_delta: bool,
    ) -> usize {
        self.broadcast(&BridgeMessage::chat(role, content, is_delta))
            .await
    }

    pub async fn broadcast_chat_delta(&self, text: impl Into<String>) -> usize {
        self.broadcast(&BridgeMessage::chat_delta(text)).await
    }

    pub async fn broadcast_tool_event(
        &self,
        tool_name: impl Into<String>,
        is_start: bool,
        result: Option<String>,
    ) -> usize {
        let message = if is_start {
            BridgeMessage::tool_started(tool_name)
        } else {
            BridgeMessage::tool_completed(tool_name, result)
        };
        self.broadcast(&message).await
    }

    fn running_slot(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn bind(port: u16) -> Result<TcpListener, BridgeError> {
    bind_first(
        &[
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        ],
        port,
    )
    .await
}

/// Bind the first address that accepts; the last failure is reported.
async fn bind_first(addrs: &[SocketAddr], port: u16) -> Result<TcpListener, BridgeError> {
    let mut last_error = None;
    for addr in addrs {
        match TcpListener::bind(*addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(%addr, error = %e, "Bind failed, trying next address");
                last_error = Some(e);
            }
        }
    }
    let source = last_error
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address"));
    Err(BridgeError::Bind { port, source })
}
