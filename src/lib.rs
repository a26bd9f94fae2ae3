//! # SSR Relay
//!
//! Out-of-process server-side rendering. Each render runs a pre-built
//! bundle in its own child process hosting a sandboxed deno_core isolate,
//! streams the markup back as it is produced, and enforces a hard deadline.
//!
//! Failures discovered before any markup was produced reject the request.
//! Failures discovered after markup started flowing can no longer change
//! the response, so they are appended to the stream as `<script>` snippets
//! that replay the diagnostics on the consumer's console.
//!
//! ## Security Guarantees
//!
//! - **No filesystem access**: only modules inside the bundle root load
//! - **No network access**: `fetch` reaches allow-listed origins only
//! - **No environment access**: the runner starts with an empty environment
//! - **Hard deadline**: the runner's process group is killed on overrun
//!
//! ## Usage
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use ssr_relay::{render_job, RenderRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let request = RenderRequest::new("./dist/server/entry-server.js", "/about")
//!         .template("./dist/client/index.html")
//!         .timeout_ms(5_000);
//!
//!     let mut stream = render_job(request).await?;
//!     while let Some(chunk) = stream.next().await {
//!         // write chunk to the HTTP response
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The bundle entry exports a function taking the capability object:
//!
//! ```js
//! export default async function ({ location, fetch, renderToStream }) {
//!   renderToStream(renderApp(location.pathname));
//! }
//! ```

pub mod config;
pub mod diagnostic;
mod error;
pub mod executor;
mod fetch;
pub mod job;
mod loader;
pub mod multiplex;
mod ops;
pub mod relay;
pub mod runtime;
pub mod supervisor;
pub mod template;

pub use config::{ExecutorConfig, RunnerCommand};
pub use diagnostic::{DiagnosticRecord, ErrorDetail, FatalKind, Kind};
pub use error::{RenderError, Result};
pub use executor::{render_job, Executor, RenderRequest};
pub use fetch::FetchPolicy;
pub use job::{CancelHandle, JobState, RenderJob};
pub use loader::SandboxedLoader;
pub use multiplex::RenderStream;
pub use runtime::{run_job, serve_runner_stdio, RunOutcome, RunnerJob};
pub use template::HtmlTemplate;
