//! SSR Relay CLI
//!
//! Single-shot mode:
//!   ssr-relay render <entry> [--location <url-or-path>] [--timeout-ms <n>]
//!                    [--template <index.html>] [--mount-id <id>]
//!                    [--root <bundle-dir>] [--allow-origin <origin>]...
//!
//!   Markup (and any relayed diagnostics) is streamed to stdout. A render
//!   that fails before producing output prints the error to stderr and
//!   exits non-zero.
//!
//! Runner mode (spawned by the executor, one process per render):
//!   ssr-relay runner
//!
//!   Reads a JSON job descriptor from stdin, writes markup to stdout and
//!   newline-delimited diagnostic records to stderr.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use ssr_relay::config::parse_origins;
use ssr_relay::{Executor, ExecutorConfig, RenderRequest};
use std::io::Write;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("SSR Relay - out-of-process server-side rendering");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  ssr-relay render <entry> [--location <url-or-path>] [--timeout-ms <n>]");
    eprintln!("                   [--template <index.html>] [--mount-id <id>] [--root <dir>]");
    eprintln!("                   [--allow-origin <origin>]...");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  ssr-relay render ./dist/server/entry.js --location /about --template ./dist/client/index.html");
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_render_args(args: &[String], config: &mut ExecutorConfig) -> Result<RenderRequest> {
    let mut iter = args.iter();
    let entry = iter
        .next()
        .filter(|a| !a.starts_with("--"))
        .ok_or_else(|| anyhow!("render requires an entry module"))?;
    let mut request = RenderRequest::new(entry, "/");

    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{} requires a value", flag))
        };
        match flag.as_str() {
            "--location" => request.location = value()?,
            "--timeout-ms" => {
                let raw = value()?;
                request.timeout_ms = raw
                    .parse()
                    .with_context(|| format!("--timeout-ms: invalid value '{}'", raw))?;
            }
            "--template" => request = request.template(value()?),
            "--mount-id" => request = request.mount_id(value()?),
            "--root" => request = request.bundle_root(value()?),
            "--allow-origin" => config.allowed_origins.extend(parse_origins(&value()?)?),
            other => return Err(anyhow!("unknown option '{}'", other)),
        }
    }

    Ok(request)
}

/// Run in single-shot mode
async fn run_render(args: &[String]) -> Result<()> {
    let mut config = ExecutorConfig::from_env()?;
    let request = parse_render_args(args, &mut config)?;
    let executor = Executor::new(config);

    let mut stream = executor.render(request).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }

    let state = stream.finished().await;
    tracing::info!(state = ?state, bytes = stream.bytes_emitted(), "render finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("runner") => {
            // stderr is the diagnostics channel here; keep it quiet.
            init_tracing("warn");
            let code = ssr_relay::serve_runner_stdio().await;
            std::process::exit(code);
        }
        Some("render") => {
            init_tracing("info");
            run_render(&args[2..]).await
        }
        _ => {
            print_usage();
            Err(anyhow!("Missing or unknown mode"))
        }
    }
}
