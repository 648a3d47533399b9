//! Tunnel error types.

/// Errors from hosting the dev tunnel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("failed to start tunnel host: {0}")]
    Spawn(String),

    #[error("no public URL within {0}s")]
    DiscoveryTimeout(u64),

    #[error("tunnel host exited before publishing a URL (exit code {exit_code:?})")]
    ProcessExited { exit_code: Option<i32> },
}
