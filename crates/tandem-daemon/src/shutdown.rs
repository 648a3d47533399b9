//! Shutdown signals.
//!
//! Handlers are installed before startup begins so a signal that arrives
//! while the bridge or tunnel is still coming up is not lost.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for Ctrl+C or SIGTERM.
pub async fn signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C shutdown signal"),
            Err(e) => {
                warn!(error = %e, "Ctrl+C handler unavailable");
                std::future::pending::<()>().await;
            }
        },
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}

/// Cancel `token` once a shutdown signal arrives.
pub fn listen(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = signal() => token.cancel(),
            () = token.cancelled() => {}
        }
    })
}

/// Drive `work` to completion unless `token` is cancelled first.
///
/// Returns `None` when cancelled; `work` is dropped at its current await.
pub async fn unless_cancelled<F: Future>(token: &CancellationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = token.cancelled() => None,
        output = work => Some(output),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn finished_work_is_returned() {
        let token = CancellationToken::new();
        assert_eq!(unless_cancelled(&token, async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_startup() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let token = CancellationToken::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Flag(Arc::clone(&dropped));
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            unless_cancelled(&token, async move {
                let _flag = flag;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }),
        )
        .await
        .expect("startup interrupted");
        assert_eq!(outcome, None);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_work() {
        let token = CancellationToken::new();
        token.cancel();
        let ran = AtomicBool::new(false);
        let outcome = unless_cancelled(&token, async { ran.store(true, Ordering::SeqCst) }).await;
        assert_eq!(outcome, None);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn listener_exits_when_token_is_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let listener = listen(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .expect("listener stopped")
            .unwrap();
    }
}
