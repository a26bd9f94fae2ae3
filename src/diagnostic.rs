//! Diagnostic records and their line-oriented wire format.
//!
//! The runner writes one JSON object per line on its diagnostics channel.
//! Every line decodes on its own, so a torn or garbled line only loses
//! itself. Lines that do not decode are ignored by the reader.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Console-equivalent call that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Log,
    Info,
    Warn,
    Error,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Log => "log",
            Kind::Info => "info",
            Kind::Warn => "warn",
            Kind::Error => "error",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" | "debug" | "trace" => Ok(Kind::Log),
            "info" => Ok(Kind::Info),
            "warn" => Ok(Kind::Warn),
            "error" => Ok(Kind::Error),
            other => Err(format!("unknown diagnostic kind '{}'", other)),
        }
    }
}

/// Job-ending failure a record stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    RuntimeThrow,
    NoRenderInvocation,
    TimedOut,
    AbnormalExit,
}

/// Error payload attached to `error` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub name: String,
    pub message: String,
    /// Stack frames without the leading `Name: message` line.
    #[serde(default)]
    pub stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalKind>,
}

/// One captured console call (or supervisor-surfaced failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub kind: Kind,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl DiagnosticRecord {
    pub fn new(kind: Kind, args: Vec<Value>) -> Self {
        Self {
            kind,
            args,
            error: None,
        }
    }

    /// Build a fatal `error` record.
    pub fn fatal(fatal: FatalKind, name: &str, message: impl Into<String>) -> Self {
        Self {
            kind: Kind::Error,
            args: Vec::new(),
            error: Some(ErrorDetail {
                name: name.to_string(),
                message: message.into(),
                stack: Vec::new(),
                fatal: Some(fatal),
            }),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.stack = stack;
        }
        self
    }

    pub fn fatal_kind(&self) -> Option<FatalKind> {
        self.error.as_ref().and_then(|e| e.fatal)
    }

    /// Human readable message: the error message if present, otherwise the
    /// args joined the way a console would print them.
    pub fn message(&self) -> String {
        match &self.error {
            Some(error) if self.args.is_empty() => error.message.clone(),
            Some(error) => format!("{} {}", join_args(&self.args), error.message),
            None => join_args(&self.args),
        }
    }
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode a record as a single newline-terminated line.
pub fn encode_line(record: &DiagnosticRecord) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line. Blank or malformed lines yield `None`.
pub fn decode_line(line: &[u8]) -> Option<DiagnosticRecord> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_slice(trimmed).ok()
}

/// Pick the record that decides a failed job: the first one marked fatal,
/// otherwise the first `error` record.
pub fn first_fatal(records: &[DiagnosticRecord]) -> Option<&DiagnosticRecord> {
    records
        .iter()
        .find(|r| r.fatal_kind().is_some())
        .or_else(|| records.iter().find(|r| r.kind == Kind::Error))
}
