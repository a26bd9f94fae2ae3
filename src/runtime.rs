//! Sandbox runner - executes one bundle in a locked-down V8 isolate.
//!
//! This is the code running inside the child process. The isolate gets only
//! the ops of the `ssr_relay_runtime` extension:
//! - console.* (captured as diagnostic records, never printed)
//! - fetch (origin allowlist)
//! - AbortController / AbortSignal
//! - renderToStream (markup channel)
//! - Module loading from the bundle root only
//! - No fs, net, env, or other system access

use crate::diagnostic::{DiagnosticRecord, FatalKind};
use crate::fetch::FetchPolicy;
use crate::loader::SandboxedLoader;
use crate::ops::{ssr_relay_runtime, DiagnosticSink, MarkupSink};
use crate::supervisor::EXIT_REPORTED_FAILURE;
use crate::template::HtmlTemplate;
use anyhow::{anyhow, Context, Error};
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, ModuleSpecifier, PollEventLoopOptions, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Job descriptor the supervisor hands to a runner on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerJob {
    pub entry: PathBuf,
    pub bundle_root: PathBuf,
    /// Absolute URL seen by the bundle as `location`.
    pub location: String,
    pub template: Option<HtmlTemplate>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub max_heap_size: Option<usize>,
}

/// How a run ended, from the runner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Rendered,
    /// A fatal diagnostic was written to the diagnostics channel.
    Failed(FatalKind),
}

/// `location` capability, shaped like the browser object.
#[derive(Debug, Serialize)]
struct LocationInfo {
    href: String,
    origin: String,
    protocol: String,
    host: String,
    hostname: String,
    port: String,
    pathname: String,
    search: String,
    hash: String,
}

impl LocationInfo {
    fn parse(href: &str) -> Result<Self, Error> {
        let url = Url::parse(href).map_err(|e| anyhow!("Invalid location '{}': {}", href, e))?;
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{}:{}", hostname, port)
        };
        Ok(Self {
            href: url.to_string(),
            origin: url.origin().ascii_serialization(),
            protocol: format!("{}:", url.scheme()),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
            hash: url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
        })
    }
}

/// Create the sandboxed isolate for `job`, wired to the given sinks.
pub fn create_runtime(
    job: &RunnerJob,
    markup: Box<dyn Write>,
    diagnostics: Box<dyn Write>,
    deadline: Option<Instant>,
) -> Result<JsRuntime, Error> {
    let loader = SandboxedLoader::new(&job.bundle_root)?;

    // Configure V8 heap limits if specified
    let create_params = job
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(loader)),
        extensions: vec![ssr_relay_runtime::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if job.max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Keep the limit; V8 raises an OOM error that ends the render.
            tracing::warn!(
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "near heap limit"
            );
            current
        });
    }

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(MarkupSink::new(markup, job.template.clone()));
        state.put(DiagnosticSink::new(diagnostics));
        state.put(FetchPolicy::new(job.allowed_origins.clone(), deadline));
    }

    Ok(runtime)
}

/// Run one job to completion.
///
/// Bundle failures are reported as a fatal record on `diagnostics` and
/// returned as `RunOutcome::Failed`. `Err` means the runner itself broke
/// (bad job, unwritable channel).
pub async fn run_job(
    job: &RunnerJob,
    markup: Box<dyn Write>,
    diagnostics: Box<dyn Write>,
) -> Result<RunOutcome, Error> {
    let timeout = Duration::from_millis(job.timeout_ms);
    let deadline = Instant::now() + timeout;
    let mut runtime = create_runtime(job, markup, diagnostics, Some(deadline))?;

    // Terminate the isolate once the deadline passes, whatever JS is doing.
    let isolate_handle = runtime.v8_isolate().thread_safe_handle();
    let fired = Arc::new(AtomicBool::new(false));
    let watchdog = {
        let fired = fired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            fired.store(true, Ordering::SeqCst);
            isolate_handle.terminate_execution();
        })
    };

    let result = drive(&mut runtime, job).await;
    watchdog.abort();

    {
        let op_state = runtime.op_state();
        let state = op_state.borrow();
        let sink = state.borrow::<MarkupSink>();
        tracing::debug!(
            invoked = sink.invoked(),
            bytes = sink.bytes_written(),
            "render driver finished"
        );
    }

    let record = match result {
        Ok(Driver::Rendered) => return Ok(RunOutcome::Rendered),
        _ if fired.load(Ordering::SeqCst) => DiagnosticRecord::fatal(
            FatalKind::TimedOut,
            "TimedOut",
            format!("render exceeded {}ms", job.timeout_ms),
        ),
        Ok(Driver::NoEntry) => DiagnosticRecord::fatal(
            FatalKind::NoRenderInvocation,
            "NoRenderInvocation",
            format!(
                "{} exports neither a default nor a `render` function",
                job.entry.display()
            ),
        ),
        Ok(Driver::NoRender) => DiagnosticRecord::fatal(
            FatalKind::NoRenderInvocation,
            "NoRenderInvocation",
            "entry returned without calling renderToStream",
        ),
        // Already reported from inside the isolate.
        Ok(Driver::Threw) => return Ok(RunOutcome::Failed(FatalKind::RuntimeThrow)),
        Err(e) => thrown_record(&e),
    };

    let kind = record.fatal_kind().unwrap_or(FatalKind::RuntimeThrow);
    runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<DiagnosticSink>()
        .emit(&record)
        .context("diagnostics channel closed")?;
    Ok(RunOutcome::Failed(kind))
}

enum Driver {
    Rendered,
    NoEntry,
    NoRender,
    Threw,
}

async fn drive(runtime: &mut JsRuntime, job: &RunnerJob) -> Result<Driver, Error> {
    let entry = job
        .entry
        .canonicalize()
        .map_err(|e| anyhow!("Invalid entry point '{}': {}", job.entry.display(), e))?;
    let specifier = ModuleSpecifier::from_file_path(&entry)
        .map_err(|_| anyhow!("Failed to create module specifier"))?;
    let location = LocationInfo::parse(&job.location)?;

    let call = format!(
        "globalThis.__ssr_relay_run__({}, {})",
        serde_json::to_string(specifier.as_str())?,
        serde_json::to_string(&location)?
    );
    let promise = runtime.execute_script("<ssr-relay>", call)?;

    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &promise);
    let promise = v8::Local::<v8::Promise>::try_from(local)
        .map_err(|_| anyhow!("Render driver did not return a promise"))?;

    match promise.state() {
        v8::PromiseState::Fulfilled => {
            let status = promise.result(scope).to_rust_string_lossy(scope);
            match status.as_str() {
                "rendered" => Ok(Driver::Rendered),
                "no-entry" => Ok(Driver::NoEntry),
                "no-render" => Ok(Driver::NoRender),
                "threw" => Ok(Driver::Threw),
                other => Err(anyhow!("Render driver returned unexpected status '{}'", other)),
            }
        }
        v8::PromiseState::Rejected => {
            let exception = promise.result(scope);
            Err(anyhow!(
                "Render driver rejected: {}",
                exception.to_rust_string_lossy(scope)
            ))
        }
        v8::PromiseState::Pending => Err(anyhow!(
            "Render never settled: the bundle awaits something that cannot resolve"
        )),
    }
}

/// Fatal record for an error that escaped the driver (uncaught rejection,
/// module evaluation failure, OOM).
fn thrown_record(error: &Error) -> DiagnosticRecord {
    match error.downcast_ref::<JsError>() {
        Some(js) => {
            let stack = js
                .stack
                .as_deref()
                .map(|s| {
                    s.lines()
                        .skip(1)
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            DiagnosticRecord::fatal(
                FatalKind::RuntimeThrow,
                js.name.as_deref().unwrap_or("Error"),
                js.message.clone().unwrap_or_else(|| js.exception_message.clone()),
            )
            .with_stack(stack)
        }
        None => DiagnosticRecord::fatal(FatalKind::RuntimeThrow, "Error", error.to_string()),
    }
}

/// Entry point of the `runner` CLI mode: job descriptor on stdin, markup on
/// stdout, diagnostics on stderr. Returns the process exit code.
pub async fn serve_runner_stdio() -> i32 {
    match serve_runner_stdio_inner().await {
        Ok(RunOutcome::Rendered) => 0,
        Ok(RunOutcome::Failed(_)) => EXIT_REPORTED_FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "runner failed");
            70
        }
    }
}

async fn serve_runner_stdio_inner() -> Result<RunOutcome, Error> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read job descriptor")?;
    let job: RunnerJob = serde_json::from_str(input.trim()).context("invalid job descriptor")?;

    run_job(
        &job,
        Box::new(std::io::stdout()),
        Box::new(std::io::stderr()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_from_path_url() {
        let location = LocationInfo::parse("http://localhost/blog/post?id=3#top").unwrap();
        assert_eq!(location.pathname, "/blog/post");
        assert_eq!(location.search, "?id=3");
        assert_eq!(location.hash, "#top");
        assert_eq!(location.origin, "http://localhost");
        assert_eq!(location.protocol, "http:");
        assert_eq!(location.port, "");
    }

    #[test]
    fn test_location_with_port() {
        let location = LocationInfo::parse("https://example.com:8443/").unwrap();
        assert_eq!(location.host, "example.com:8443");
        assert_eq!(location.hostname, "example.com");
        assert_eq!(location.port, "8443");
    }

    #[test]
    fn test_relative_location_rejected() {
        assert!(LocationInfo::parse("/no-base").is_err());
    }

    #[test]
    fn test_descriptor_defaults() {
        let job: RunnerJob = serde_json::from_str(
            r#"{"entry":"/b/e.js","bundle_root":"/b","location":"http://localhost/","template":null,"timeout_ms":10}"#,
        )
        .unwrap();
        assert!(job.allowed_origins.is_empty());
        assert_eq!(job.max_heap_size, None);
    }
}
