//! Notification delivery strategies.
//!
//! Headless hosts deliver inline. Hosts whose observers must run on one
//! owning task post to a queue that the owner drains.

use tokio::sync::mpsc;
use tracing::debug;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs notification jobs on the context the host requires.
pub trait Dispatcher: Send + Sync {
    fn post(&self, job: Job);
}

/// Runs every job immediately on the calling task.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&self, job: Job) {
        job();
    }
}

/// Posts jobs to a [`DispatchQueue`] owned by another task.
///
/// Falls back to inline execution once the queue is gone.
#[derive(Debug, Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving side of a [`QueueDispatcher`].
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl QueueDispatcher {
    pub fn new() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DispatchQueue { rx })
    }
}

impl Dispatcher for QueueDispatcher {
    fn post(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            debug!("Dispatch queue closed, running inline");
            job();
        }
    }
}

impl DispatchQueue {
    /// Run jobs in posting order until every dispatcher is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job();
        }
    }

    /// Run the jobs queued so far and return how many ran.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue").finish_non_exhaustive()
    }
}
