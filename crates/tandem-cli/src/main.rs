//! Tandem CLI
//!
//! Follows a shared agent session from another machine and sends prompts
//! into it.

use clap::Parser;
use tokio::sync::mpsc;
use tracing::error;

use tandem_cli::connection::{BridgeClient, ClientConfig};
use tandem_cli::headless::{self, HeadlessConfig};

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(version, about = "Follow and drive a shared agent session", long_about = None)]
struct Cli {
    /// Share URL printed by the daemon (https://... or ws://host:port)
    url: String,

    /// Tunnel access token
    #[arg(long, env = "TANDEM_TUNNEL_TOKEN")]
    token: Option<String>,

    /// Send one prompt, print the reply and exit
    #[arg(short, long)]
    prompt: Option<String>,

    /// Only follow the session, do not read prompts from stdin
    #[arg(long)]
    follow: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "TANDEM_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TANDEM_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _ = rustls::crypto::ring::default_provider().install_default();
    let log_filter = format!("tandem_cli={},tandem_core={}", cli.log_level, cli.log_level);
    tandem_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let config = ClientConfig {
        connect_timeout: std::time::Duration::from_secs(cli.connect_timeout),
        ..ClientConfig::default()
    };
    let (events_tx, events_rx) = mpsc::channel(256);
    let client = BridgeClient::new(config, events_tx);
    client.connect(&cli.url, cli.token.as_deref()).await?;

    let headless_config = HeadlessConfig {
        prompt: cli.prompt,
        read_stdin: !cli.follow,
    };
    let result = headless::run(&client, events_rx, headless_config).await;
    client.disconnect().await;

    if let Err(e) = &result {
        error!(error = %e, "Headless session ended with an error");
    }
    result.map_err(Into::into)
}
