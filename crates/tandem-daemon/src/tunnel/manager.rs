//! Dev tunnel host process.
//!
//! Starts the tunnel CLI for the bridge port, scrapes the public URL from its
//! output and owns the process until [`TunnelManager::stop`].

use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tandem_core::config::TunnelConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use crate::subprocess::{
    ExecutableLocator, OutputLine, OutputStream, SpawnRequest, SupervisedProcess, supervisor,
};

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[\w-]+\.[\w.]+devtunnels\.ms").expect("static regex is valid")
});

const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const EXIT_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle of the hosted tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Error,
    Stopping,
}

/// First dev tunnel URL in `line`.
pub fn find_public_url(line: &str) -> Option<&str> {
    URL_RE.find(line).map(|m| m.as_str())
}

struct Hosted {
    process: SupervisedProcess,
    drain: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Details {
    public_url: Option<String>,
    access_token: Option<String>,
}

/// Owns at most one tunnel host process.
pub struct TunnelManager {
    config: TunnelConfig,
    state_tx: watch::Sender<TunnelState>,
    hosted: tokio::sync::Mutex<Option<Hosted>>,
    details: Mutex<Details>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::NotStarted);
        Self {
            config,
            state_tx,
            hosted: tokio::sync::Mutex::new(None),
            details: Mutex::new(Details::default()),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    pub fn public_url(&self) -> Option<String> {
        self.details().public_url.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.details().access_token.clone()
    }

    /// Host a tunnel for `port` and wait for its public URL.
    ///
    /// A previously hosted process is stopped first. The process is owned as
    /// soon as it is spawned, so on discovery timeout or when this future is
    /// dropped mid-discovery it is still released by [`Self::stop`].
    pub async fn start(&self, port: u16) -> Result<String, TunnelError> {
        let mut hosted = self.hosted.lock().await;
        if let Some(previous) = hosted.take() {
            info!("Replacing running tunnel host");
            Self::release(previous).await;
            *self.details() = Details::default();
        }

        let locator = ExecutableLocator::new(
            &self.config.executable_name,
            self.config.executable_candidates.clone(),
        );
        let Some(program) = locator.locate().await else {
            warn!(name = locator.name(), "Tunnel executable not found");
            self.set_state(TunnelState::Error);
            return Err(TunnelError::ExecutableNotFound(locator.name().to_string()));
        };

        self.set_state(TunnelState::Starting);
        let args = self.config.host_args_for(port);
        info!(program = %program.display(), ?args, "Starting tunnel host");
        let mut process = match supervisor::spawn(SpawnRequest::new(program, args)) {
            Ok(process) => process,
            Err(e) => {
                self.set_state(TunnelState::Error);
                return Err(TunnelError::Spawn(e.to_string()));
            }
        };
        debug!(pid = ?process.id(), "Tunnel host spawned");
        let Some(mut output) = process.take_output() else {
            process.terminate(TERMINATE_GRACE).await;
            self.set_state(TunnelState::Error);
            return Err(TunnelError::Spawn("tunnel output unavailable".to_string()));
        };

        let current = hosted.insert(Hosted {
            process,
            drain: None,
        });
        let timeout = self.config.discovery_timeout();
        match tokio::time::timeout(timeout, discover_url(&mut output)).await {
            Ok(Some(url)) => {
                info!(url, "Tunnel is public");
                {
                    let mut details = self.details();
                    details.public_url = Some(url.clone());
                    details.access_token.clone_from(&self.config.access_token);
                }
                current.drain = Some(tokio::spawn(drain_output(output)));
                self.set_state(TunnelState::Running);
                Ok(url)
            }
            Ok(None) => {
                let exit_code = tokio::time::timeout(EXIT_WAIT, current.process.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                *hosted = None;
                warn!(?exit_code, "Tunnel host exited before publishing a URL");
                self.set_state(TunnelState::Error);
                Err(TunnelError::ProcessExited { exit_code })
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Tunnel URL discovery timed out");
                current.drain = Some(tokio::spawn(drain_output(output)));
                self.set_state(TunnelState::Error);
                Err(TunnelError::DiscoveryTimeout(timeout.as_secs()))
            }
        }
    }

    /// Terminate the owned tunnel process, if any. Errors are swallowed.
    pub async fn stop(&self) {
        let mut hosted = self.hosted.lock().await;
        self.set_state(TunnelState::Stopping);
        if let Some(previous) = hosted.take() {
            Self::release(previous).await;
            info!("Tunnel host stopped");
        }
        drop(hosted);
        *self.details() = Details::default();
        self.set_state(TunnelState::NotStarted);
    }

    async fn release(mut hosted: Hosted) {
        hosted.process.terminate(TERMINATE_GRACE).await;
        if let Some(drain) = hosted.drain {
            drain.abort();
        }
    }

    fn set_state(&self, state: TunnelState) {
        debug!(?state, "Tunnel state");
        self.state_tx.send_replace(state);
    }

    fn details(&self) -> MutexGuard<'_, Details> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read output until a public URL appears or both pipes close.
async fn discover_url(output: &mut mpsc::Receiver<OutputLine>) -> Option<String> {
    while let Some(line) = output.recv().await {
        match line.stream {
            OutputStream::Stdout => {
                info!(target: "tandem_daemon::tunnel::host", "{}", line.text);
                if let Some(url) = find_public_url(&line.text) {
                    return Some(url.to_string());
                }
            }
            OutputStream::Stderr => {
                warn!(target: "tandem_daemon::tunnel::host", "{}", line.text);
            }
        }
    }
    None
}

async fn drain_output(mut output: mpsc::Receiver<OutputLine>) {
    while let Some(line) = output.recv().await {
        debug!(target: "tandem_daemon::tunnel::host", stream = ?line.stream, "{}", line.text);
    }
}
