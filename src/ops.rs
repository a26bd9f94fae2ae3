//! Ops backing the runner's capability object.
//!
//! Markup and diagnostics leave the isolate only through these ops; the
//! sinks they write to are placed in `OpState` by `create_runtime`.

use crate::diagnostic::{encode_line, DiagnosticRecord, ErrorDetail, Kind};
use crate::fetch::op_fetch;
use crate::template::HtmlTemplate;
use deno_core::error::AnyError;
use deno_core::{op2, JsBuffer, OpState};
use serde_json::Value;
use std::io::Write;

// ============================================================================
// Markup channel
// ============================================================================

/// Where rendered markup goes, wrapped in the page template.
///
/// The template head is held back until the producer yields its first
/// non-empty chunk, so a producer that fails up front leaves the markup
/// channel empty.
pub struct MarkupSink {
    out: Box<dyn Write>,
    template: Option<HtmlTemplate>,
    invoked: bool,
    head_written: bool,
    closed: bool,
    bytes_written: u64,
}

impl MarkupSink {
    pub fn new(out: Box<dyn Write>, template: Option<HtmlTemplate>) -> Self {
        Self {
            out,
            template,
            invoked: false,
            head_written: false,
            closed: false,
            bytes_written: 0,
        }
    }

    /// Claim the sink for the first `renderToStream` call. Later calls get
    /// `false`.
    pub fn begin(&mut self) -> bool {
        if self.invoked {
            return false;
        }
        self.invoked = true;
        true
    }

    pub fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if chunk.is_empty() || !self.invoked || self.closed {
            return Ok(());
        }
        self.open()?;
        self.emit(chunk)
    }

    /// Finish the markup. A completed producer that wrote nothing still
    /// gets the bare template; a failed one only closes what was opened.
    /// Idempotent.
    pub fn end(&mut self, completed: bool) -> std::io::Result<()> {
        if !self.invoked || self.closed {
            return Ok(());
        }
        if completed {
            self.open()?;
        }
        self.closed = true;
        if self.head_written {
            if let Some(tail) = self.template.as_ref().map(|t| t.tail.clone()) {
                self.emit(tail.as_bytes())?;
            }
        }
        Ok(())
    }

    pub fn invoked(&self) -> bool {
        self.invoked
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn open(&mut self) -> std::io::Result<()> {
        if self.head_written {
            return Ok(());
        }
        self.head_written = true;
        if let Some(head) = self.template.as_ref().map(|t| t.head.clone()) {
            self.emit(head.as_bytes())?;
        }
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.out.write_all(bytes)?;
        self.out.flush()?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

#[op2(fast)]
fn op_render_begin(state: &mut OpState) -> bool {
    state.borrow_mut::<MarkupSink>().begin()
}

#[op2(fast)]
fn op_render_write(state: &mut OpState, #[string] chunk: String) -> Result<(), AnyError> {
    Ok(state.borrow_mut::<MarkupSink>().write(chunk.as_bytes())?)
}

#[op2]
fn op_render_write_bytes(state: &mut OpState, #[buffer] chunk: JsBuffer) -> Result<(), AnyError> {
    Ok(state.borrow_mut::<MarkupSink>().write(&chunk)?)
}

#[op2(fast)]
fn op_render_end(state: &mut OpState, completed: bool) -> Result<(), AnyError> {
    Ok(state.borrow_mut::<MarkupSink>().end(completed)?)
}

// ============================================================================
// Diagnostics channel
// ============================================================================

/// Line-oriented diagnostics writer.
pub struct DiagnosticSink {
    out: Box<dyn Write>,
}

impl DiagnosticSink {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self { out }
    }

    pub fn emit(&mut self, record: &DiagnosticRecord) -> std::io::Result<()> {
        let line = encode_line(record).map_err(std::io::Error::other)?;
        self.out.write_all(&line)?;
        self.out.flush()
    }
}

#[op2]
fn op_diagnostic(
    state: &mut OpState,
    #[string] kind: String,
    #[serde] args: Vec<Value>,
    #[serde] error: Option<ErrorDetail>,
) -> Result<(), AnyError> {
    let kind = kind.parse::<Kind>().unwrap_or(Kind::Log);
    let record = DiagnosticRecord { kind, args, error };
    Ok(state.borrow_mut::<DiagnosticSink>().emit(&record)?)
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    ssr_relay_runtime,
    ops = [
        op_render_begin,
        op_render_write,
        op_render_write_bytes,
        op_render_end,
        op_diagnostic,
        op_fetch,
    ],
    esm_entry_point = "ext:ssr_relay_runtime/bootstrap.js",
    esm = ["ext:ssr_relay_runtime/bootstrap.js" = "src/bootstrap.js"],
);
