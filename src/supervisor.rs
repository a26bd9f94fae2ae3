//! Runner process lifecycle: spawn, deadline, forced termination, exit
//! classification.
//!
//! One process per job. The supervisor never retries: bundle code may
//! already have had side effects (a fetch issued, say) by the time it
//! fails.

use crate::config::ExecutorConfig;
use crate::diagnostic::{decode_line, DiagnosticRecord, FatalKind};
use crate::error::RenderError;
use crate::job::CancelHandle;
use crate::runtime::RunnerJob;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Exit code a runner uses after it reported its own fatal diagnostic.
pub const EXIT_REPORTED_FAILURE: i32 = 1;

/// Raw (non-record) stderr lines kept for abnormal-exit reports.
const MAX_RAW_LINES: usize = 64;

/// How a runner process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerExit {
    Completed,
    /// The runner reported a fatal diagnostic and exited on its own.
    Failed,
    TimedOut,
    AbnormalExit { status: String },
}

/// Everything the runner said on its diagnostics channel, plus any record
/// the supervisor surfaced itself (always last).
#[derive(Debug, Clone)]
pub struct Termination {
    pub records: Vec<DiagnosticRecord>,
    pub exit: RunnerExit,
}

/// A live runner: its markup channel and the eventual termination report.
pub struct SpawnedRunner {
    pub markup: ChildStdout,
    pub termination: JoinHandle<Termination>,
}

#[derive(Debug, Default)]
struct Collected {
    records: Vec<DiagnosticRecord>,
    raw: VecDeque<String>,
}

enum Overrun {
    Deadline,
    Cancelled,
}

/// Spawn the runner for `job` and start supervising it.
///
/// The deadline counts from this call.
pub fn spawn(
    config: &ExecutorConfig,
    job: &RunnerJob,
    timeout: Duration,
    cancel: CancelHandle,
) -> Result<SpawnedRunner, RenderError> {
    let mut command = Command::new(&config.runner.program);
    command
        .args(&config.runner.args)
        .env_clear()
        .envs(&config.runner.env)
        .current_dir(&job.bundle_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(RenderError::Spawn)?;
    info!(pid = ?child.id(), program = %config.runner.program.display(), "spawned runner");

    let stdin = child.stdin.take();
    let markup = child
        .stdout
        .take()
        .ok_or_else(|| RenderError::Spawn(std::io::Error::other("runner stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RenderError::Spawn(std::io::Error::other("runner stderr not captured")))?;

    let mut payload = serde_json::to_vec(job).map_err(|e| RenderError::Validation(e.to_string()))?;
    payload.push(b'\n');
    if let Some(mut stdin) = stdin {
        tokio::spawn(
            async move {
                // A runner that never reads its job may already be gone.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "runner did not accept job descriptor");
                }
                let _ = stdin.shutdown().await;
            }
            .in_current_span(),
        );
    }

    let collector = tokio::spawn(collect_diagnostics(stderr).in_current_span());
    let termination = tokio::spawn(
        supervise(child, collector, timeout, config.kill_grace, cancel).in_current_span(),
    );

    Ok(SpawnedRunner {
        markup,
        termination,
    })
}

async fn collect_diagnostics(stderr: ChildStderr) -> Collected {
    let mut reader = BufReader::new(stderr);
    let mut collected = Collected::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => match decode_line(&line) {
                Some(record) => collected.records.push(record),
                None => {
                    let text = String::from_utf8_lossy(&line).trim_end().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    if collected.raw.len() == MAX_RAW_LINES {
                        collected.raw.pop_front();
                    }
                    collected.raw.push_back(text);
                }
            },
            Err(e) => {
                warn!(error = %e, "diagnostics channel read failed");
                break;
            }
        }
    }
    collected
}

async fn supervise(
    mut child: Child,
    collector: JoinHandle<Collected>,
    timeout: Duration,
    kill_grace: Duration,
    cancel: CancelHandle,
) -> Termination {
    let (status, overrun) = tokio::select! {
        status = child.wait() => (status, None),
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "runner exceeded deadline");
            (terminate(&mut child, kill_grace).await, Some(Overrun::Deadline))
        }
        _ = cancel.cancelled() => {
            info!("render cancelled, terminating runner");
            (terminate(&mut child, kill_grace).await, Some(Overrun::Cancelled))
        }
    };

    // The runner is gone, so its end of the pipe is closing; bound the drain
    // in case a stray descendant still holds it.
    let collected = match tokio::time::timeout(kill_grace, collector).await {
        Ok(Ok(collected)) => collected,
        Ok(Err(e)) => {
            warn!(error = %e, "diagnostics collector failed");
            Collected::default()
        }
        Err(_) => {
            warn!("diagnostics channel still open after runner exit");
            Collected::default()
        }
    };

    let termination = classify(status, overrun, collected, timeout);
    debug!(exit = ?termination.exit, records = termination.records.len(), "runner finished");
    termination
}

fn classify(
    status: std::io::Result<ExitStatus>,
    overrun: Option<Overrun>,
    collected: Collected,
    timeout: Duration,
) -> Termination {
    let Collected { mut records, raw } = collected;
    let reported_fatal = records.iter().any(|r| r.fatal_kind().is_some());

    let exit = match overrun {
        Some(overrun) => {
            let already_reported = records
                .iter()
                .any(|r| r.fatal_kind() == Some(FatalKind::TimedOut));
            if !already_reported {
                let message = match overrun {
                    Overrun::Deadline => format!("render exceeded {}ms", timeout.as_millis()),
                    Overrun::Cancelled => "render cancelled".to_string(),
                };
                records.push(DiagnosticRecord::fatal(FatalKind::TimedOut, "TimedOut", message));
            }
            RunnerExit::TimedOut
        }
        None => match status {
            Ok(status) if status.success() => RunnerExit::Completed,
            Ok(status) if status.code() == Some(EXIT_REPORTED_FAILURE) && reported_fatal => {
                // The runner's own watchdog fired before ours did.
                let timed_out = records
                    .iter()
                    .any(|r| r.fatal_kind() == Some(FatalKind::TimedOut));
                if timed_out {
                    RunnerExit::TimedOut
                } else {
                    RunnerExit::Failed
                }
            }
            Ok(status) => abnormal(&mut records, status.to_string(), raw),
            Err(e) => abnormal(&mut records, format!("wait failed: {}", e), raw),
        },
    };

    Termination { records, exit }
}

fn abnormal(records: &mut Vec<DiagnosticRecord>, status: String, raw: VecDeque<String>) -> RunnerExit {
    warn!(status = %status, "runner exited abnormally");
    let output = raw.into_iter().map(serde_json::Value::String).collect();
    records.push(
        DiagnosticRecord::fatal(FatalKind::AbnormalExit, "AbnormalExit", status.clone()).with_args(output),
    );
    RunnerExit::AbnormalExit { status }
}

/// SIGTERM the runner's process group, then SIGKILL if it is still alive
/// after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    let pgid = child.id().map(|pid| pid as libc::pid_t);

    #[cfg(unix)]
    if let Some(pgid) = pgid {
        // SAFETY: plain signal delivery to the group we created at spawn.
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        warn!(pid = pgid, "SIGTERM grace elapsed, sending SIGKILL");
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    child.start_kill()?;
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Kind;
    use serde_json::json;

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    fn collected(records: Vec<DiagnosticRecord>, raw: &[&str]) -> Collected {
        Collected {
            records,
            raw: raw.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_clean_exit() {
        let t = classify(Ok(exit_status(0)), None, collected(vec![], &[]), Duration::from_secs(1));
        assert_eq!(t.exit, RunnerExit::Completed);
        assert!(t.records.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_reported_failure_adds_nothing() {
        let thrown = DiagnosticRecord::fatal(FatalKind::RuntimeThrow, "Error", "boom");
        let t = classify(
            Ok(exit_status(EXIT_REPORTED_FAILURE)),
            None,
            collected(vec![thrown.clone()], &[]),
            Duration::from_secs(1),
        );
        assert_eq!(t.exit, RunnerExit::Failed);
        assert_eq!(t.records, vec![thrown]);
    }

    #[cfg(unix)]
    #[test]
    fn test_reported_timeout_is_timed_out() {
        let reported = DiagnosticRecord::fatal(FatalKind::TimedOut, "TimedOut", "render exceeded 50ms");
        let t = classify(
            Ok(exit_status(EXIT_REPORTED_FAILURE)),
            None,
            collected(vec![reported.clone()], &[]),
            Duration::from_millis(50),
        );
        assert_eq!(t.exit, RunnerExit::TimedOut);
        assert_eq!(t.records, vec![reported]);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_one_without_report_is_abnormal() {
        let t = classify(
            Ok(exit_status(1)),
            None,
            collected(vec![DiagnosticRecord::new(Kind::Log, vec![json!("hi")])], &["panicked at src/x.rs"]),
            Duration::from_secs(1),
        );
        assert!(matches!(t.exit, RunnerExit::AbnormalExit { .. }));
        let last = t.records.last().unwrap();
        assert_eq!(last.fatal_kind(), Some(FatalKind::AbnormalExit));
        assert_eq!(last.args, vec![json!("panicked at src/x.rs")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_single_timeout_record() {
        let reported = DiagnosticRecord::fatal(FatalKind::TimedOut, "TimedOut", "runner deadline");
        let t = classify(
            Ok(exit_status(1)),
            Some(Overrun::Deadline),
            collected(vec![reported], &[]),
            Duration::from_millis(50),
        );
        assert_eq!(t.exit, RunnerExit::TimedOut);
        let timeouts = t
            .records
            .iter()
            .filter(|r| r.fatal_kind() == Some(FatalKind::TimedOut))
            .count();
        assert_eq!(timeouts, 1);

        let t = classify(Ok(exit_status(0)), Some(Overrun::Cancelled), collected(vec![], &[]), Duration::from_millis(50));
        assert_eq!(t.records.len(), 1);
        assert_eq!(t.records[0].message(), "render cancelled");
    }
}
