//! Consumer-side relay of diagnostics appended after committed markup.
//!
//! The helper below is a fixed script; records are substituted into a
//! fixed call template as JSON. Nothing is generated from function source.

use crate::diagnostic::{DiagnosticRecord, ErrorDetail};
use crate::error::RenderError;
use serde::Serialize;

/// Global name of the relay helper on the consumer side.
pub const RELAY_FN: &str = "__ssrRelay";

/// Defines `__ssrRelay(kind, args, error)`. Error records are rebuilt as an
/// `Error` whose stack is the original one, indented under the message.
pub const RELAY_HELPER: &str = concat!(
    "<script>function __ssrRelay(k,a,e){",
    "if(typeof console===\"undefined\")return;",
    "var c=console,f=c[k]||c.log,p=\"[SSR]\";",
    "if(e){",
    "var m=p+\" \"+e.message,x=new Error(m);",
    "x.name=e.name;",
    "x.stack=e.name+\": \"+m+(e.stack&&e.stack.length?\"\\n\"+e.stack.map(function(l){return\"    \"+l}).join(\"\\n\"):\"\");",
    "f.apply(c,a.length?[p].concat(a,[x]):[x]);",
    "return}",
    "f.apply(c,[p].concat(a))",
    "}</script>",
);

#[derive(Serialize)]
struct RelayedError<'a> {
    name: &'a str,
    message: &'a str,
    stack: &'a [String],
}

impl<'a> From<&'a ErrorDetail> for RelayedError<'a> {
    fn from(detail: &'a ErrorDetail) -> Self {
        Self {
            name: &detail.name,
            message: &detail.message,
            stack: &detail.stack,
        }
    }
}

/// Render one record as a `<script>` invocation of the helper.
///
/// Fails when the encoded payload is larger than `max_bytes`.
pub fn render_invocation(record: &DiagnosticRecord, max_bytes: usize) -> Result<String, RenderError> {
    let args = script_safe_json(&record.args)?;
    let error = match &record.error {
        Some(detail) => Some(script_safe_json(&RelayedError::from(detail))?),
        None => None,
    };

    let payload_len = args.len() + error.as_ref().map_or(0, String::len);
    if payload_len > max_bytes {
        return Err(RenderError::RelayEncoding(format!(
            "{} record payload is {} bytes (limit {})",
            record.kind, payload_len, max_bytes
        )));
    }

    let kind = record.kind.as_str();
    Ok(match error {
        Some(error) => format!("<script>{}(\"{}\",{},{})</script>", RELAY_FN, kind, args, error),
        None => format!("<script>{}(\"{}\",{})</script>", RELAY_FN, kind, args),
    })
}

/// Build the stream tail for a committed job: the helper once, then one
/// invocation per record in emission order. Records that cannot be encoded
/// are dropped. Returns an empty string when nothing is relayed.
pub fn render_tail(records: &[DiagnosticRecord], max_bytes: usize) -> String {
    let mut tail = String::new();
    for record in records {
        match render_invocation(record, max_bytes) {
            Ok(snippet) => {
                if tail.is_empty() {
                    tail.push_str(RELAY_HELPER);
                }
                tail.push_str(&snippet);
            }
            Err(e) => {
                tracing::warn!(kind = %record.kind, error = %e, "dropping diagnostic from relay");
            }
        }
    }
    tail
}

/// JSON that can sit verbatim inside a `<script>` element.
fn script_safe_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RenderError> {
    let raw = serde_json::to_string(value).map_err(|e| RenderError::RelayEncoding(e.to_string()))?;
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    Ok(out)
}
