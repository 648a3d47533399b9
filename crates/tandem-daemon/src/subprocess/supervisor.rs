//! External process supervision.
//!
//! Runs short-lived tools to completion and supervises long-running children
//! (the agent CLI, the tunnel host, build scripts). Output is always captured,
//! never inherited from the daemon's console.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Exit code reported when the process could not be started at all.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// Result of running a command to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout when it has content, stderr otherwise. For streamed runs, every
    /// line in arrival order.
    pub output: String,
}

impl CommandOutput {
    fn spawn_failed(reason: String) -> Self {
        Self {
            exit_code: SPAWN_FAILED_EXIT_CODE,
            output: reason,
        }
    }

    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

fn command<S: AsRef<OsStr>>(
    program: &OsStr,
    args: &[S],
    working_directory: Option<&Path>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    cmd
}

/// Run a command to completion.
///
/// Never fails: a spawn error is reported as [`SPAWN_FAILED_EXIT_CODE`] with
/// the reason as output. Dropping the future kills the child, so callers may
/// bound it with `tokio::time::timeout`.
pub async fn run<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    working_directory: Option<&Path>,
) -> CommandOutput {
    let program = program.as_ref();
    let output = match command(program, args, working_directory).output().await {
        Ok(output) => output,
        Err(e) => {
            debug!(program = ?program, error = %e, "Failed to start command");
            return CommandOutput::spawn_failed(e.to_string());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let text = if stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout
    };

    CommandOutput {
        exit_code: output.status.code().unwrap_or(SPAWN_FAILED_EXIT_CODE),
        output: text,
    }
}

/// Run a command to completion, forwarding each stdout/stderr line to
/// `line_sink` as it arrives.
pub async fn run_streaming<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    working_directory: Option<&Path>,
    line_sink: Option<mpsc::UnboundedSender<String>>,
) -> CommandOutput {
    let request = SpawnRequest {
        program: PathBuf::from(program.as_ref()),
        args: args
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect(),
        working_directory: working_directory.map(Path::to_path_buf),
        pipe_stdin: false,
    };
    let mut process = match spawn(request) {
        Ok(process) => process,
        Err(e) => return CommandOutput::spawn_failed(e.to_string()),
    };

    let mut lines = Vec::new();
    if let Some(mut output) = process.take_output() {
        while let Some(line) = output.recv().await {
            if let Some(sink) = &line_sink {
                let _ = sink.send(line.text.clone());
            }
            lines.push(line.text);
        }
    }

    let exit_code = match process.wait().await {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "Failed waiting for streamed command");
            SPAWN_FAILED_EXIT_CODE
        }
    };

    CommandOutput {
        exit_code,
        output: lines.join("\n"),
    }
}

/// Parameters for a long-running child.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Open a stdin pipe fed through [`SupervisedProcess::stdin`].
    pub pipe_stdin: bool,
}

impl SpawnRequest {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_directory: None,
            pipe_stdin: false,
        }
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }
}

/// Errors from spawning a supervised process.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Process stdin is closed")]
    StdinClosed,
}

/// A running child whose output is streamed line by line.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    stdin_tx: Option<mpsc::Sender<String>>,
    output_rx: Option<mpsc::Receiver<OutputLine>>,
}

/// Start a long-running child.
///
/// On unix the child leads a new process group so [`SupervisedProcess::terminate`]
/// reaches every helper it forks.
pub fn spawn(request: SpawnRequest) -> Result<SupervisedProcess, SubprocessError> {
    let program_name = request.program.display().to_string();
    let mut cmd = command(
        request.program.as_os_str(),
        &request.args,
        request.working_directory.as_deref(),
    );
    if request.pipe_stdin {
        cmd.stdin(Stdio::piped());
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
        program: program_name.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id();
    info!(program = %program_name, ?pid, "Spawned supervised process");

    let stdin_tx = child.stdin.take().map(|stdin| {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("Failed to write to stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush stdin: {}", e);
                    break;
                }
            }
        });
        tx
    });

    let (output_tx, output_rx) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, OutputStream::Stdout, output_tx.clone(), pid);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, OutputStream::Stderr, output_tx, pid);
    }

    Ok(SupervisedProcess {
        child,
        pid,
        stdin_tx,
        output_rx: Some(output_rx),
    })
}

fn spawn_line_reader<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
    pid: Option<u32>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(OutputLine { stream, text }).await.is_err() {
                break;
            }
        }
        debug!(?pid, ?stream, "Output reader finished");
    });
}

impl SupervisedProcess {
    pub const fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Merged stdout/stderr lines. Closes once both pipes reach EOF.
    /// Can be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output_rx.take()
    }

    /// Sender for stdin lines (newline appended per line).
    pub fn stdin(&self) -> Result<mpsc::Sender<String>, SubprocessError> {
        self.stdin_tx.clone().ok_or(SubprocessError::StdinClosed)
    }

    /// Exit code if the child has already exited.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(SPAWN_FAILED_EXIT_CODE)),
            _ => None,
        }
    }

    pub async fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(SPAWN_FAILED_EXIT_CODE))
    }

    /// Terminate the child and every process in its tree.
    ///
    /// Asks politely first and force-kills after `grace`. Failures are logged
    /// and swallowed.
    pub async fn terminate(&mut self, grace: Duration) {
        self.stdin_tx = None;
        let Some(pid) = self.pid else {
            self.child.kill().await.ok();
            return;
        };

        #[cfg(unix)]
        {
            if let Err(e) = signal_group(pid, libc::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM to process group failed");
            }
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => info!(pid, ?status, "Process exited after SIGTERM"),
                Ok(Err(e)) => warn!(pid, error = %e, "Error waiting for process"),
                Err(_) => warn!(pid, "Timeout waiting for graceful shutdown, killing"),
            }
            // Sweep helpers that outlived the group leader.
            let _ = signal_group(pid, libc::SIGKILL);
            self.child.kill().await.ok();
        }

        #[cfg(windows)]
        {
            let _ = grace;
            let result = run("taskkill", &["/T", "/F", "/PID", &pid.to_string()], None).await;
            if !result.success() {
                debug!(pid, output = %result.output, "taskkill failed");
            }
            self.child.kill().await.ok();
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = grace;
            self.child.kill().await.ok();
        }
    }
}

/// Send `signal` to every process in the group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pgid <= 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "refusing to signal a protected process group",
        ));
    }
    // SAFETY: pgid is the group id of a child we spawned with process_group(0);
    // kill(2) with a negative pid only targets that group.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
