//! Headless mode.
//!
//! Follows the shared session on stdout. Prompts come from `--prompt` (one
//! turn, then exit) or from stdin lines.

use std::io::Write as _;

use tandem_core::protocol::{ChatMessage, ChatRole, SessionState, ToolEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connection::{BridgeClient, ClientError, ClientEvent};

/// Headless mode configuration.
#[derive(Debug, Clone, Default)]
pub struct HeadlessConfig {
    /// Send this prompt, wait for the turn to finish, then exit.
    pub prompt: Option<String>,
    /// Read prompts from stdin while following.
    pub read_stdin: bool,
}

/// Headless mode errors.
#[derive(Debug, thiserror::Error)]
pub enum HeadlessError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Connection to the bridge was lost")]
    ConnectionLost,

    #[error("Output failed: {0}")]
    Output(#[from] std::io::Error),
}

/// Turns bridge events into console text.
///
/// Streamed fragments are written inline; the final assistant message only
/// closes the line when fragments were already shown.
#[derive(Debug, Default)]
pub struct Renderer {
    streaming: bool,
    busy: bool,
    intent: Option<String>,
}

impl Renderer {
    pub fn render(&mut self, event: &ClientEvent) -> Option<String> {
        match event {
            ClientEvent::ConnectionChanged(true) => Some("[connected]\n".to_string()),
            ClientEvent::ConnectionChanged(false) => Some(self.break_line("[disconnected]\n")),
            ClientEvent::Chat(chat) => self.render_chat(chat),
            ClientEvent::Tool(tool) => Some(self.render_tool(tool)),
            ClientEvent::State(state) => self.render_state(state),
        }
    }

    fn render_chat(&mut self, chat: &ChatMessage) -> Option<String> {
        match (chat.role, chat.is_delta) {
            (ChatRole::Assistant, true) => {
                self.streaming = true;
                Some(chat.content.clone())
            }
            (ChatRole::Assistant, false) => {
                if std::mem::take(&mut self.streaming) {
                    Some("\n".to_string())
                } else {
                    Some(format!("{}\n", chat.content))
                }
            }
            (ChatRole::User, _) => Some(self.break_line(&format!("> {}\n", chat.content))),
            (ChatRole::System, _) => Some(self.break_line(&format!("[system] {}\n", chat.content))),
        }
    }

    fn render_tool(&mut self, tool: &ToolEvent) -> String {
        let line = if tool.is_start {
            format!("[tool] {}\n", tool.tool_name)
        } else {
            format!("[tool] {} done\n", tool.tool_name)
        };
        self.break_line(&line)
    }

    fn render_state(&mut self, state: &SessionState) -> Option<String> {
        let was_busy = std::mem::replace(&mut self.busy, state.is_busy);
        let intent_changed = self.intent != state.current_intent;
        self.intent.clone_from(&state.current_intent);

        if !state.is_connected {
            return Some(self.break_line("[host disconnected]\n"));
        }
        match (&state.current_intent, state.is_busy) {
            (Some(intent), true) if intent_changed => {
                Some(self.break_line(&format!("[working] {intent}\n")))
            }
            (None, true) if !was_busy => Some(self.break_line("[working]\n")),
            _ => None,
        }
    }

    fn break_line(&mut self, line: &str) -> String {
        if std::mem::take(&mut self.streaming) {
            format!("\n{line}")
        } else {
            line.to_string()
        }
    }
}

/// Tracks when a one-shot prompt has been answered.
#[derive(Debug, Default)]
pub struct TurnWatch {
    seen_busy: bool,
}

impl TurnWatch {
    /// Returns true once the turn is over.
    pub fn observe(&mut self, event: &ClientEvent) -> bool {
        match event {
            ClientEvent::State(state) if state.is_busy => {
                self.seen_busy = true;
                false
            }
            ClientEvent::State(_) => self.seen_busy,
            // Rejections arrive as system messages without a busy phase.
            ClientEvent::Chat(chat) => chat.role == ChatRole::System && !self.seen_busy,
            _ => false,
        }
    }
}

/// Run headless mode until the connection drops, the one-shot turn ends or
/// Ctrl+C is pressed.
pub async fn run(
    client: &BridgeClient,
    mut events: mpsc::Receiver<ClientEvent>,
    config: HeadlessConfig,
) -> Result<(), HeadlessError> {
    let one_shot = config.prompt.is_some();
    if let Some(prompt) = &config.prompt {
        client.send_prompt(prompt).await?;
        info!("Prompt sent");
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    let stdin_task = (config.read_stdin && !one_shot).then(|| tokio::spawn(read_lines(line_tx)));

    let mut renderer = Renderer::default();
    let mut turn = TurnWatch::default();
    let mut out = std::io::stdout();

    let result = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break Err(HeadlessError::ConnectionLost);
                };
                if let Some(text) = renderer.render(&event) {
                    write!(out, "{text}")?;
                    out.flush()?;
                }
                if event == ClientEvent::ConnectionChanged(false) {
                    break Err(HeadlessError::ConnectionLost);
                }
                if one_shot && turn.observe(&event) {
                    break Ok(());
                }
            }
            Some(line) = line_rx.recv() => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = client.send_prompt(line).await {
                    warn!(error = %e, "Failed to send prompt");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    result
}

async fn read_lines(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
