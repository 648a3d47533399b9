//! Host environment check.
//!
//! Runs an ordered list of version probes and publishes the step table after
//! every transition so a UI can render progress.

use tandem_core::Config;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::subprocess::locate::VERSION_PROBE_TIMEOUT;
use crate::subprocess::{ExecutableLocator, supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Warning,
    Failed,
}

impl StepStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "ok",
            Self::Warning => "warning",
            Self::Failed => "failed",
        }
    }
}

/// Published view of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    pub detail: Option<String>,
}

/// A tool whose presence is checked with `--version`.
#[derive(Debug, Clone)]
pub struct CheckStep {
    pub name: String,
    pub description: String,
    pub locator: ExecutableLocator,
    /// Missing optional tools produce a warning instead of a failure.
    pub optional: bool,
}

impl CheckStep {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        locator: ExecutableLocator,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            locator,
            optional: false,
        }
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn pending(&self) -> StepReport {
        StepReport {
            name: self.name.clone(),
            description: self.description.clone(),
            status: StepStatus::Pending,
            detail: None,
        }
    }

    async fn probe(&self) -> (StepStatus, String) {
        let missing = if self.optional {
            StepStatus::Warning
        } else {
            StepStatus::Failed
        };
        let Some(program) = self.locator.locate().await else {
            return (missing, format!("{} not found", self.locator.name()));
        };

        let probe = supervisor::run(&program, &["--version"], None);
        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(output) if output.success() => {
                let version = output.output.lines().next().unwrap_or_default().trim();
                let detail = if version.is_empty() {
                    program.display().to_string()
                } else {
                    version.to_string()
                };
                (StepStatus::Success, detail)
            }
            Ok(output) => (missing, format!("exit code {}: {}", output.exit_code, output.output)),
            Err(_) => (missing, "version probe timed out".to_string()),
        }
    }
}

/// Sequential environment check.
pub struct Doctor {
    steps: Vec<CheckStep>,
    reports_tx: watch::Sender<Vec<StepReport>>,
}

impl Doctor {
    pub fn new(steps: Vec<CheckStep>) -> Self {
        let reports = steps.iter().map(CheckStep::pending).collect();
        let (reports_tx, _) = watch::channel(reports);
        Self { steps, reports_tx }
    }

    /// The checks a host needs: the agent CLI, the tunnel CLI and git.
    pub fn standard(config: &Config) -> Self {
        let mut claude_candidates = config.agent.claude_candidates.clone();
        if let Some(bin) = &config.agent.claude_bin {
            claude_candidates.insert(0, bin.display().to_string());
        }

        Self::new(vec![
            CheckStep::new(
                "claude",
                "Agent CLI hosting the session",
                ExecutableLocator::new("claude", claude_candidates),
            ),
            CheckStep::new(
                "devtunnel",
                "Dev tunnel CLI for remote access",
                ExecutableLocator::new(
                    config.tunnel.executable_name.clone(),
                    config.tunnel.executable_candidates.clone(),
                ),
            )
            .optional(),
            CheckStep::new(
                "git",
                "Version control used by the agent",
                ExecutableLocator::new("git", Vec::new()),
            ),
        ])
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<StepReport>> {
        self.reports_tx.subscribe()
    }

    pub fn reports(&self) -> Vec<StepReport> {
        self.reports_tx.borrow().clone()
    }

    /// Run every step in order. Returns `false` if any step failed.
    pub async fn run(&self) -> bool {
        self.reports_tx.send_modify(|reports| {
            for report in reports.iter_mut() {
                report.status = StepStatus::Pending;
                report.detail = None;
            }
        });

        let mut passed = true;
        for (index, step) in self.steps.iter().enumerate() {
            self.update(index, StepStatus::Running, None);
            let (status, detail) = step.probe().await;
            match status {
                StepStatus::Failed => {
                    warn!(step = %step.name, detail, "Environment check failed");
                    passed = false;
                }
                StepStatus::Warning => {
                    warn!(step = %step.name, detail, "Environment check warning");
                }
                _ => info!(step = %step.name, detail, "Environment check passed"),
            }
            self.update(index, status, Some(detail));
        }
        passed
    }

    fn update(&self, index: usize, status: StepStatus, detail: Option<String>) {
        self.reports_tx.send_modify(|reports| {
            if let Some(report) = reports.get_mut(index) {
                report.status = status;
                report.detail = detail;
            }
        });
    }
}
