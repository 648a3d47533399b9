//! Backend driving the `claude` CLI in stream-json mode.
//!
//! Each session is one long-lived `claude -p` process: prompts are written to
//! its stdin as user messages and its stdout is translated into session
//! events by [`EventBridge`].

pub mod translate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tandem_core::config::AgentConfig;
use tandem_core::ndjson;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::backend::{AgentBackend, AttachedBackend, BackendClient, BackendSession};
use super::error::AgentError;
use super::types::{SessionEvent, SessionOptions};
use crate::subprocess::locate::VERSION_PROBE_TIMEOUT;
use crate::subprocess::{
    ExecutableLocator, OutputLine, OutputStream, SpawnRequest, SupervisedProcess, supervisor,
};

pub use translate::EventBridge;

/// How the agent handles tool permission prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PermissionStrategy {
    /// Approve every tool call (`--dangerously-skip-permissions`).
    #[default]
    SkipPermissions,
    /// Pre-approve the listed tools (`--allowedTools`). Others are denied.
    AllowedTools(Vec<String>),
}

impl PermissionStrategy {
    fn args(&self) -> Vec<String> {
        match self {
            Self::SkipPermissions => vec!["--dangerously-skip-permissions".to_string()],
            Self::AllowedTools(tools) if tools.is_empty() => Vec::new(),
            Self::AllowedTools(tools) => {
                let mut args = vec!["--allowedTools".to_string()];
                args.extend(tools.iter().cloned());
                args
            }
        }
    }
}

/// Agent backend backed by the `claude` executable.
#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    locator: ExecutableLocator,
    explicit_bin: Option<PathBuf>,
    permission: PermissionStrategy,
    terminate_timeout: Duration,
}

impl ClaudeBackend {
    pub fn from_config(config: &AgentConfig) -> Self {
        let permission = if config.skip_permissions {
            PermissionStrategy::SkipPermissions
        } else {
            PermissionStrategy::AllowedTools(config.allowed_tools.clone())
        };
        Self {
            locator: ExecutableLocator::new("claude", config.claude_candidates.clone()),
            explicit_bin: config.claude_bin.clone(),
            permission,
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
        }
    }

    async fn resolve_program(&self) -> Option<PathBuf> {
        match &self.explicit_bin {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(path) => {
                let probe = supervisor::run(path, &["--version"], None);
                let output = tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await.ok()?;
                output.success().then(|| path.clone())
            }
            None => self.locator.locate().await,
        }
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    async fn connect(
        &self,
        working_directory: Option<&Path>,
    ) -> Result<Box<dyn BackendClient>, AgentError> {
        let program = self.resolve_program().await.ok_or_else(|| {
            AgentError::BackendUnavailable("claude executable not found".to_string())
        })?;
        let working_directory = resolve_working_directory(working_directory);
        info!(
            program = %program.display(),
            working_dir = %working_directory.display(),
            "Using claude executable"
        );
        Ok(Box::new(ClaudeClient {
            program,
            working_directory,
            permission: self.permission.clone(),
            terminate_timeout: self.terminate_timeout,
        }))
    }
}

fn resolve_working_directory(requested: Option<&Path>) -> PathBuf {
    match requested {
        Some(dir) if dir.is_dir() => dir.to_path_buf(),
        _ => {
            let fallback = std::env::current_dir()
                .ok()
                .or_else(dirs::home_dir)
                .unwrap_or_else(std::env::temp_dir);
            if let Some(dir) = requested {
                warn!(
                    requested = %dir.display(),
                    fallback = %fallback.display(),
                    "Working directory missing, using fallback"
                );
            }
            fallback
        }
    }
}

struct ClaudeClient {
    program: PathBuf,
    working_directory: PathBuf,
    permission: PermissionStrategy,
    terminate_timeout: Duration,
}

impl ClaudeClient {
    fn session_args(
        &self,
        resume: Option<&str>,
        session_id: &str,
        options: &SessionOptions,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        if resume.is_some() {
            args.extend(["--resume".to_string(), session_id.to_string()]);
        } else {
            args.extend(["--session-id".to_string(), session_id.to_string()]);
        }
        if let Some(model) = &options.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(prompt) = &options.system_prompt {
            args.extend(["--append-system-prompt".to_string(), prompt.clone()]);
        }
        args.extend(self.permission.args());
        args
    }

    fn start(
        &self,
        resume: Option<&str>,
        options: &SessionOptions,
    ) -> Result<AttachedBackend, AgentError> {
        let session_id = resume.map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);
        let args = self.session_args(resume, &session_id, options);
        let request = SpawnRequest::new(&self.program, args)
            .working_directory(&self.working_directory)
            .with_stdin();

        let mut process = supervisor::spawn(request)
            .map_err(|e| AgentError::BackendUnavailable(e.to_string()))?;
        let stdin = process
            .stdin()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        let output = process
            .take_output()
            .ok_or_else(|| AgentError::Transport("agent output unavailable".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(read_events(output, events_tx, session_id.clone()));

        info!(
            session_id,
            pid = ?process.id(),
            resumed = resume.is_some(),
            model = ?options.model,
            "Spawned claude session"
        );
        Ok(AttachedBackend {
            session: Arc::new(ClaudeSession {
                id: session_id,
                stdin,
                process: Mutex::new(process),
                terminate_timeout: self.terminate_timeout,
            }),
            events: events_rx,
        })
    }
}

#[async_trait]
impl BackendClient for ClaudeClient {
    async fn create_session(
        &self,
        options: &SessionOptions,
    ) -> Result<AttachedBackend, AgentError> {
        self.start(None, options)
    }

    async fn resume_session(
        &self,
        session_id: &str,
        options: &SessionOptions,
    ) -> Result<AttachedBackend, AgentError> {
        self.start(Some(session_id), options)
    }

    async fn stop(&self) {
        debug!(program = %self.program.display(), "Claude client stopped");
    }
}

struct ClaudeSession {
    id: String,
    stdin: mpsc::Sender<String>,
    process: Mutex<SupervisedProcess>,
    terminate_timeout: Duration,
}

#[async_trait]
impl BackendSession for ClaudeSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, prompt: &str) -> Result<(), AgentError> {
        self.stdin
            .send(ndjson::user_message_line(&self.id, prompt))
            .await
            .map_err(|_| AgentError::Transport("agent stdin closed".to_string()))
    }

    async fn dispose(&self) {
        self.process.lock().await.terminate(self.terminate_timeout).await;
    }
}

/// Translate agent output until the process closes its pipes.
async fn read_events(
    mut output: mpsc::Receiver<OutputLine>,
    events: mpsc::Sender<SessionEvent>,
    session_id: String,
) {
    let mut bridge = EventBridge::new();
    while let Some(line) = output.recv().await {
        match line.stream {
            OutputStream::Stderr => warn!(session_id, "stderr: {}", line.text),
            OutputStream::Stdout => {
                if line.text.trim().is_empty() {
                    continue;
                }
                let msg = match ndjson::parse_line(&line.text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(session_id, error = %e, "Skipping unparsable agent output");
                        continue;
                    }
                };
                for event in bridge.convert(msg) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    info!(session_id, "Agent output closed");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client(permission: PermissionStrategy) -> ClaudeClient {
        ClaudeClient {
            program: PathBuf::from("claude"),
            working_directory: PathBuf::from("/tmp"),
            permission,
            terminate_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn create_args_pin_session_id_and_model() {
        let args = client(PermissionStrategy::SkipPermissions).session_args(
            None,
            "abc",
            &SessionOptions {
                model: Some("claude-sonnet-4".into()),
                system_prompt: Some("be brief".into()),
            },
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-p --input-format stream-json --output-format stream-json"));
        assert!(joined.contains("--session-id abc"));
        assert!(joined.contains("--model claude-sonnet-4"));
        assert!(joined.contains("--append-system-prompt be brief"));
        assert!(joined.ends_with("--dangerously-skip-permissions"));
    }

    #[test]
    fn resume_args_use_resume_flag() {
        let args = client(PermissionStrategy::AllowedTools(vec!["Read".into(), "Edit".into()]))
            .session_args(Some("old"), "old", &SessionOptions::default());
        let joined = args.join(" ");
        assert!(joined.contains("--resume old"));
        assert!(!joined.contains("--session-id"));
        assert!(joined.ends_with("--allowedTools Read Edit"));
    }

    #[test]
    fn empty_allow_list_adds_no_flags() {
        assert!(PermissionStrategy::AllowedTools(Vec::new()).args().is_empty());
    }

    #[tokio::test]
    async fn missing_executable_is_backend_unavailable() {
        let backend = ClaudeBackend {
            locator: ExecutableLocator::new("tandem-no-such-claude", Vec::new()),
            explicit_bin: None,
            permission: PermissionStrategy::default(),
            terminate_timeout: Duration::from_secs(1),
        };
        let err = backend.connect(None).await.err().unwrap();
        assert!(matches!(err, AgentError::BackendUnavailable(_)));
    }

    /// A shell script standing in for the agent: echoes a canned turn for
    /// every stdin line.
    #[cfg(unix)]
    #[tokio::test]
    async fn scripted_agent_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("claude");
        std::fs::write(
            &script,
            r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"s","model":"m"}'
while read line; do
  echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}'
  echo 'not json'
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hi there"}]}}'
  echo '{"type":"result","subtype":"success","is_error":false}'
done
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = ClaudeBackend {
            locator: ExecutableLocator::new("claude", vec![script.display().to_string()]),
            explicit_bin: None,
            permission: PermissionStrategy::default(),
            terminate_timeout: Duration::from_secs(1),
        };
        let client = backend.connect(Some(dir.path())).await.unwrap();
        let AttachedBackend {
            session,
            mut events,
        } = client.create_session(&SessionOptions::default()).await.unwrap();

        session.send("hello").await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = event == SessionEvent::TurnIdle;
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                SessionEvent::ContentDelta("Hi".into()),
                SessionEvent::ContentComplete("Hi there".into()),
                SessionEvent::TurnIdle,
            ]
        );

        session.dispose().await;
        assert!(events.recv().await.is_none());
    }
}
