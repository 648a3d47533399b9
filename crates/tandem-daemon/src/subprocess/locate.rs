//! Executable discovery.
//!
//! Candidates are data: an ordered list of install locations taken from
//! configuration. The first one that exists wins; otherwise the bare name is
//! probed with `--version` on `PATH`.

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use super::supervisor;

/// Upper bound for the `--version` probe.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered lookup strategy for one executable.
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    name: String,
    candidates: Vec<String>,
}

impl ExecutableLocator {
    pub fn new(name: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First configured candidate that exists on disk.
    pub fn find_candidate(&self) -> Option<PathBuf> {
        self.candidates
            .iter()
            .filter_map(|raw| tandem_core::config::expand_path(raw))
            .find(|path| path.is_file())
    }

    /// Resolve the executable, or `None` when it is not installed.
    pub async fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = self.find_candidate() {
            debug!(name = %self.name, path = %path.display(), "Found executable candidate");
            return Some(path);
        }

        let probe = supervisor::run(&self.name, &["--version"], None);
        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(output) if output.success() => {
                debug!(name = %self.name, version = %output.output, "Executable found on PATH");
                Some(PathBuf::from(&self.name))
            }
            Ok(output) => {
                debug!(name = %self.name, exit_code = output.exit_code, "Version probe failed");
                None
            }
            Err(_) => {
                debug!(name = %self.name, "Version probe timed out");
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let second = dir.path().join("second");
        let third = dir.path().join("third");
        std::fs::write(&second, "").unwrap();
        std::fs::write(&third, "").unwrap();

        let locator = ExecutableLocator::new(
            "tool",
            vec![
                dir.path().join("missing").display().to_string(),
                second.display().to_string(),
                third.display().to_string(),
            ],
        );
        assert_eq!(locator.find_candidate(), Some(second));
    }

    #[test]
    fn directories_are_not_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ExecutableLocator::new("tool", vec![dir.path().display().to_string()]);
        assert!(locator.find_candidate().is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_not_located() {
        let locator = ExecutableLocator::new("tandem-no-such-tool", Vec::new());
        assert!(locator.locate().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bare_name_probe_falls_back_to_path() {
        let locator = ExecutableLocator::new("true", vec!["/nonexistent/true".into()]);
        assert_eq!(locator.locate().await, Some(PathBuf::from("true")));
    }
}
