//! Project relaunch script runner.
//!
//! Projects opt in by shipping `Scripts/relaunch.sh` (or `relaunch.ps1` on
//! Windows). The agent is told about it in its system prompt and the host
//! can run it on demand.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::subprocess::supervisor;

/// Result of one relaunch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchOutcome {
    pub success: bool,
    pub output: String,
}

/// Relaunch script location relative to the project directory.
pub fn script_relative_path() -> PathBuf {
    let name = if cfg!(windows) {
        "relaunch.ps1"
    } else {
        "relaunch.sh"
    };
    Path::new("Scripts").join(name)
}

pub fn script_path(project_directory: &Path) -> PathBuf {
    project_directory.join(script_relative_path())
}

/// Run the project's relaunch script to completion.
///
/// Every output line is logged and, when `line_sink` is given, forwarded to
/// it as it arrives.
pub async fn relaunch(
    project_directory: &Path,
    line_sink: Option<mpsc::UnboundedSender<String>>,
) -> RelaunchOutcome {
    let script = script_path(project_directory);
    if !script.is_file() {
        warn!(script = %script.display(), "Relaunch script not found");
        return RelaunchOutcome {
            success: false,
            output: format!("Relaunch script not found: {}", script.display()),
        };
    }

    #[cfg(unix)]
    if let Err(e) = make_executable(&script).await {
        warn!(script = %script.display(), error = %e, "Failed to mark relaunch script executable");
    }

    let (program, args) = interpreter(&script);
    info!(script = %script.display(), "Running relaunch script");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let logger = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            info!(target: "tandem_daemon::relaunch::script", "{}", line);
            if let Some(sink) = &line_sink {
                let _ = sink.send(line);
            }
        }
    });

    let result =
        supervisor::run_streaming(program, &args[..], Some(project_directory), Some(tx)).await;
    let _ = logger.await;

    info!(exit_code = result.exit_code, "Relaunch script finished");
    RelaunchOutcome {
        success: result.success(),
        output: result.output,
    }
}

fn interpreter(script: &Path) -> (&'static str, Vec<String>) {
    let script = script.display().to_string();
    if cfg!(windows) {
        (
            "powershell",
            vec![
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
                script,
            ],
        )
    } else {
        ("bash", vec![script])
    }
}

#[cfg(unix)]
async fn make_executable(script: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(script).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    tokio::fs::set_permissions(script, permissions).await
}
