//! Joins a runner's markup and diagnostics into the outward byte stream.
//!
//! Markup is forwarded chunk by chunk through a bounded channel, so a slow
//! consumer stalls reads from the runner's stdout and, through the pipe,
//! the runner itself. Diagnostics are only looked at once markup ends.

use crate::diagnostic::first_fatal;
use crate::error::RenderError;
use crate::job::{CancelHandle, JobState, RenderJob};
use crate::relay;
use crate::supervisor::{RunnerExit, SpawnedRunner, Termination};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn, Instrument};

/// Sizing for one multiplexer.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub chunk_size: usize,
    pub capacity: usize,
    pub max_relay_record_bytes: usize,
}

/// The outward byte stream of a committed job.
///
/// Yields markup as the runner produces it, then any relayed diagnostics.
/// Dropping the stream cancels the runner.
pub struct RenderStream {
    chunks: mpsc::Receiver<Bytes>,
    progress: watch::Receiver<Progress>,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    state: JobState,
    bytes_emitted: u64,
}

impl RenderStream {
    pub fn state(&self) -> JobState {
        self.progress.borrow().state
    }

    /// Markup bytes handed to the stream so far (relay snippets excluded).
    pub fn bytes_emitted(&self) -> u64 {
        self.progress.borrow().bytes_emitted
    }

    /// Wait for the job to reach a terminal state. The stream must be
    /// drained concurrently (or already), otherwise backpressure keeps the
    /// job running until its deadline.
    pub async fn finished(&mut self) -> JobState {
        let waited = self
            .progress
            .wait_for(|p| p.state.is_terminal())
            .await
            .map(|progress| progress.state);
        match waited {
            Ok(state) => state,
            Err(_) => self.progress.borrow().state,
        }
    }
}

impl Stream for RenderStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.chunks.poll_recv(cx)
    }
}

/// Apply the commit rule to a freshly spawned runner.
///
/// Waits for the first markup bytes. If they arrive the job is committed
/// and a stream is returned; if markup ends empty the job fails with its
/// deciding diagnostic.
pub async fn assemble(
    mut job: RenderJob,
    runner: SpawnedRunner,
    cancel: CancelHandle,
    limits: StreamLimits,
) -> Result<RenderStream, RenderError> {
    let SpawnedRunner {
        mut markup,
        termination,
    } = runner;
    job.start();

    let first = read_chunk(&mut markup, limits.chunk_size).await;
    let Some(first) = first else {
        let termination = await_termination(termination).await;
        return Err(reject(&mut job, &termination));
    };

    job.record_bytes(first.len());
    debug!(bytes = first.len(), "job committed");

    let (tx, rx) = mpsc::channel(limits.capacity.max(1));
    let (progress_tx, progress_rx) = watch::channel(Progress {
        state: job.state(),
        bytes_emitted: job.bytes_emitted(),
    });

    tokio::spawn(
        forward(job, first, markup, termination, tx, progress_tx, cancel, limits).in_current_span(),
    );

    Ok(RenderStream {
        chunks: rx,
        progress: progress_rx,
    })
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    mut job: RenderJob,
    first: Bytes,
    mut markup: ChildStdout,
    termination: tokio::task::JoinHandle<Termination>,
    tx: mpsc::Sender<Bytes>,
    progress: watch::Sender<Progress>,
    cancel: CancelHandle,
    limits: StreamLimits,
) {
    let mut consumer_gone = tx.send(first).await.is_err();

    while !consumer_gone {
        // A consumer can go away while the runner is quiet.
        let next = tokio::select! {
            chunk = read_chunk(&mut markup, limits.chunk_size) => chunk,
            _ = tx.closed() => {
                consumer_gone = true;
                break;
            }
        };
        let Some(chunk) = next else {
            break;
        };
        let n = chunk.len();
        if tx.send(chunk).await.is_err() {
            consumer_gone = true;
            break;
        }
        job.record_bytes(n);
        progress.send_modify(|p| p.bytes_emitted = job.bytes_emitted());
    }

    if consumer_gone {
        debug!("consumer dropped the stream, cancelling runner");
        cancel.cancel();
    }

    let termination = await_termination(termination).await;
    job.finish(terminal_state(&termination.exit));

    if !consumer_gone {
        let tail = relay::render_tail(&termination.records, limits.max_relay_record_bytes);
        if !tail.is_empty() {
            let _ = tx.send(Bytes::from(tail)).await;
        }
    }

    debug!(state = ?job.state(), bytes = job.bytes_emitted(), "job finished");
    progress.send_replace(Progress {
        state: job.state(),
        bytes_emitted: job.bytes_emitted(),
    });
}

/// Next non-empty chunk of markup, or `None` once the channel is closed.
async fn read_chunk(markup: &mut ChildStdout, chunk_size: usize) -> Option<Bytes> {
    let mut buf = BytesMut::with_capacity(chunk_size.max(1));
    match markup.read_buf(&mut buf).await {
        Ok(0) => None,
        Ok(_) => Some(buf.freeze()),
        Err(e) => {
            warn!(error = %e, "markup channel read failed");
            None
        }
    }
}

async fn await_termination(handle: tokio::task::JoinHandle<Termination>) -> Termination {
    match handle.await {
        Ok(termination) => termination,
        Err(e) => {
            warn!(error = %e, "supervisor task failed");
            Termination {
                records: Vec::new(),
                exit: RunnerExit::AbnormalExit {
                    status: format!("supervisor task failed: {}", e),
                },
            }
        }
    }
}

fn terminal_state(exit: &RunnerExit) -> JobState {
    match exit {
        RunnerExit::Completed => JobState::Completed,
        RunnerExit::TimedOut => JobState::TimedOut,
        RunnerExit::Failed | RunnerExit::AbnormalExit { .. } => JobState::Failed,
    }
}

fn reject(job: &mut RenderJob, termination: &Termination) -> RenderError {
    let error = match first_fatal(&termination.records) {
        Some(record) => RenderError::from_diagnostic(record),
        None => match &termination.exit {
            RunnerExit::AbnormalExit { status } => RenderError::AbnormalExit {
                status: status.clone(),
                output: Vec::new(),
            },
            _ => RenderError::NoOutput,
        },
    };
    let state = match (&termination.exit, &error) {
        (RunnerExit::TimedOut, _) | (_, RenderError::TimedOut(_)) => JobState::TimedOut,
        _ => JobState::Failed,
    };
    job.finish(state);
    warn!(state = ?job.state(), error = %error, "render rejected before commit");
    error
}
