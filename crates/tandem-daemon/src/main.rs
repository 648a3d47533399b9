//! `Tandem` Daemon
//!
//! Hosts one agent session in a project directory and replicates it to
//! remote clients over the WebSocket bridge, optionally through a dev tunnel.

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tandem_core::Config;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tandem_daemon::agent::{AgentNotification, AgentSession, ClaudeBackend, SessionOptions};
use tandem_daemon::doctor::Doctor;
use tandem_daemon::relay::BridgeRelay;
use tandem_daemon::server::{BridgeServer, RemotePrompt, ServerConfig};
use tandem_daemon::tunnel::TunnelManager;
use tandem_daemon::{prompt, relaunch, shutdown};

#[derive(Parser, Debug)]
#[command(name = "tandem-daemon")]
#[command(version, about = "Tandem daemon - shares a local agent session with remote clients")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bridge server port (overrides settings and `TANDEM_PORT`)
    #[arg(long)]
    port: Option<u16>,

    /// Project directory the agent works in (defaults to the current directory)
    #[arg(long, env = "TANDEM_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Model for the session (defaults to the configured default model)
    #[arg(long)]
    model: Option<String>,

    /// Resume an existing agent session instead of creating one
    #[arg(long)]
    resume: Option<String>,

    /// Expose the bridge through a dev tunnel
    #[arg(long)]
    tunnel: bool,

    /// Path to the `claude` CLI binary
    #[arg(long)]
    claude_bin: Option<PathBuf>,

    /// Do not read prompts from stdin
    #[arg(long)]
    no_stdin: bool,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TANDEM_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the tools the host relies on are installed
    Doctor,
    /// Run the project's relaunch script
    Relaunch {
        /// Project directory (defaults to --project-dir or the current directory)
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = tandem_core::config::load_config(Some(&project_dir))?;
    apply_args(&mut config, &args);

    let level = &config.bridge.log_level;
    let log_filter = format!("tandem_daemon={level},tandem_core={level}");
    tandem_core::tracing_init::init_tracing(&log_filter, args.log_json);

    match &args.command {
        Some(Command::Doctor) => run_doctor(&config).await,
        Some(Command::Relaunch { dir }) => run_relaunch(dir.clone().unwrap_or(project_dir)).await,
        None => host(&args, config, project_dir).await,
    }
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(port) = args.port {
        config.bridge.port = port;
    }
    if let Some(level) = &args.log_level {
        config.bridge.log_level.clone_from(level);
    }
    if let Some(bin) = &args.claude_bin {
        config.agent.claude_bin = Some(bin.clone());
    }
}

async fn host(args: &Args, config: Config, project_dir: PathBuf) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project_dir = %project_dir.display(),
        port = config.bridge.port,
        tunnel = args.tunnel,
        "Starting tandem-daemon"
    );

    let stop = CancellationToken::new();
    let signals = shutdown::listen(stop.clone());

    let backend = Arc::new(ClaudeBackend::from_config(&config.agent));
    let session = Arc::new(AgentSession::new(
        backend,
        config.agent.default_model.clone(),
    ));
    let mut host = Host {
        console: tokio::spawn(print_notifications(session.subscribe())),
        session,
        server: None,
        relay: None,
        tunnel: None,
        stdin_task: None,
    };

    let startup = host.start(args, &config, &project_dir);
    let result = match shutdown::unless_cancelled(&stop, startup).await {
        Some(Ok(addr)) => {
            info!(%addr, "Bridge ready");
            stop.cancelled().await;
            Ok(())
        }
        Some(Err(e)) => Err(e),
        None => {
            info!("Shutdown requested during startup");
            Ok(())
        }
    };

    host.stop().await;
    signals.abort();
    info!("Daemon stopped");
    result
}

/// Everything the host has brought up so far.
struct Host {
    session: Arc<AgentSession>,
    console: JoinHandle<()>,
    server: Option<Arc<BridgeServer>>,
    relay: Option<BridgeRelay>,
    tunnel: Option<TunnelManager>,
    stdin_task: Option<JoinHandle<()>>,
}

impl Host {
    /// Bring up the session, bridge and tunnel. Each part is recorded as soon
    /// as it exists so [`Self::stop`] can release it if startup is cut short.
    async fn start(
        &mut self,
        args: &Args,
        config: &Config,
        project_dir: &Path,
    ) -> anyhow::Result<SocketAddr> {
        self.session.connect(Some(project_dir.to_path_buf())).await?;
        let session_id = if let Some(id) = &args.resume {
            self.session.resume_session(id, args.model.clone()).await?
        } else {
            let options = SessionOptions {
                model: args.model.clone(),
                system_prompt: Some(prompt::build_system_prompt(project_dir)),
            };
            self.session.create_session(options).await?
        };
        info!(session_id, "Agent session ready");

        let (prompt_tx, prompt_rx) = mpsc::channel::<RemotePrompt>(64);
        let server = Arc::new(BridgeServer::new(
            ServerConfig::from_bridge(&config.bridge),
            prompt_tx.clone(),
        ));
        let server = self.server.insert(server);
        let addr = server.start(config.bridge.port).await?;
        server.broadcast_state(&self.session.snapshot()).await;
        self.relay = Some(BridgeRelay::spawn(
            Arc::clone(&self.session),
            Arc::clone(server),
            prompt_rx,
        ));

        if args.tunnel {
            let tunnel = self.tunnel.insert(TunnelManager::new(config.tunnel.clone()));
            match tunnel.start(addr.port()).await {
                Ok(url) => {
                    let mut out = std::io::stdout();
                    let _ = writeln!(out, "Share this URL: {url}");
                    if let Some(token) = tunnel.access_token() {
                        let _ = writeln!(out, "Access token: {token}");
                    }
                }
                Err(e) => warn!(error = %e, "Tunnel unavailable, bridge is local only"),
            }
        }

        if !args.no_stdin {
            self.stdin_task = Some(tokio::spawn(read_stdin_prompts(prompt_tx)));
        }
        Ok(addr)
    }

    async fn stop(self) {
        if let Some(task) = self.stdin_task {
            task.abort();
        }
        if let Some(relay) = self.relay {
            relay.shutdown().await;
        }
        if let Some(tunnel) = self.tunnel {
            tunnel.stop().await;
        }
        if let Some(server) = self.server {
            server.stop().await;
        }
        self.session.shutdown().await;
        self.console.abort();
    }
}

/// Feed host console lines into the shared prompt queue.
async fn read_stdin_prompts(prompt_tx: mpsc::Sender<RemotePrompt>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if prompt_tx.send(RemotePrompt::local(line)).await.is_err() {
            break;
        }
    }
}

/// Mirror the conversation on the host console.
async fn print_notifications(mut rx: broadcast::Receiver<AgentNotification>) {
    loop {
        let notification = match rx.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let mut out = std::io::stdout();
        let _ = match notification {
            AgentNotification::ContentComplete(text) => writeln!(out, "{text}\n"),
            AgentNotification::ToolStarted { name } => writeln!(out, "[tool] {name}"),
            AgentNotification::IntentChanged(intent) => writeln!(out, "[intent] {intent}"),
            AgentNotification::Error(message) => writeln!(out, "[error] {message}"),
            _ => Ok(()),
        };
    }
}

async fn run_doctor(config: &Config) -> anyhow::Result<()> {
    let doctor = Doctor::standard(config);
    let passed = doctor.run().await;

    let mut out = std::io::stdout();
    for report in doctor.reports() {
        writeln!(
            out,
            "{:<10} {:<8} {}",
            report.name,
            report.status.label(),
            report.detail.unwrap_or_default()
        )?;
    }
    if passed {
        Ok(())
    } else {
        Err(anyhow::anyhow!("environment check failed"))
    }
}

async fn run_relaunch(project_dir: PathBuf) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut out = std::io::stdout();
        while let Some(line) = rx.recv().await {
            let _ = writeln!(out, "{line}");
        }
    });
    let outcome = relaunch::relaunch(&project_dir, Some(tx)).await;
    let _ = printer.await;

    if outcome.success {
        Ok(())
    } else {
        Err(anyhow::anyhow!("relaunch failed: {}", outcome.output))
    }
}
