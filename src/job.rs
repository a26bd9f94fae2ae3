//! Per-request job bookkeeping and cancellation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a render job. The three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::TimedOut | JobState::Failed)
    }
}

/// One render request, from validation until its stream ends.
#[derive(Debug)]
pub struct RenderJob {
    id: u64,
    entry_path: PathBuf,
    location: String,
    timeout: Duration,
    state: JobState,
    bytes_emitted: u64,
}

impl RenderJob {
    pub fn new(entry_path: PathBuf, location: String, timeout: Duration) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            entry_path,
            location,
            timeout,
            state: JobState::Pending,
            bytes_emitted: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entry_path(&self) -> &PathBuf {
        &self.entry_path
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted
    }

    /// Markup has reached the consumer; failures must now be relayed.
    pub fn is_committed(&self) -> bool {
        self.bytes_emitted > 0
    }

    pub fn start(&mut self) {
        if self.state == JobState::Pending {
            self.state = JobState::Running;
        }
    }

    pub fn record_bytes(&mut self, n: usize) {
        self.bytes_emitted += n as u64;
    }

    /// Move to a terminal state. Returns false (and changes nothing) if the
    /// job already finished or `state` is not terminal.
    pub fn finish(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.state = state;
        true
    }
}

/// Upstream cancellation signal. Cancelling has the same effect as the job
/// running out of time.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a
        // closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancels when dropped unless disarmed.
    pub(crate) fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            handle: Some(self.clone()),
        }
    }
}

pub(crate) struct CancelOnDrop {
    handle: Option<CancelHandle>,
}

impl CancelOnDrop {
    pub(crate) fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
