//! Error types surfaced to callers of the executor.

use crate::diagnostic::{DiagnosticRecord, FatalKind};
use std::path::PathBuf;
use thiserror::Error;

/// Why a render request was rejected.
///
/// Only pre-commit failures ever reach the caller as a `RenderError`. Once
/// markup has been handed to the consumer, failures are relayed inside the
/// stream instead.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid render request: {0}")]
    Validation(String),

    #[error("bundle never invoked renderToStream: {0}")]
    NoRenderInvocation(String),

    #[error("malformed template {}: {reason}", path.display())]
    MalformedTemplate { path: PathBuf, reason: String },

    #[error("render timed out: {0}")]
    TimedOut(String),

    #[error("render process exited abnormally ({status})")]
    AbnormalExit { status: String, output: Vec<String> },

    #[error("{name}: {message}")]
    RuntimeThrow {
        name: String,
        message: String,
        stack: Vec<String>,
    },

    #[error("diagnostic could not be relayed: {0}")]
    RelayEncoding(String),

    #[error("render produced no output and reported no error")]
    NoOutput,

    #[error("failed to spawn render process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Turn the deciding diagnostic of a failed, uncommitted job into the
    /// error the caller sees.
    pub fn from_diagnostic(record: &DiagnosticRecord) -> Self {
        let message = record.message();
        match (record.fatal_kind(), &record.error) {
            (Some(FatalKind::TimedOut), _) => RenderError::TimedOut(message),
            (Some(FatalKind::NoRenderInvocation), _) => RenderError::NoRenderInvocation(message),
            (Some(FatalKind::AbnormalExit), Some(error)) => RenderError::AbnormalExit {
                status: error.message.clone(),
                output: record
                    .args
                    .iter()
                    .filter_map(|arg| arg.as_str().map(str::to_string))
                    .collect(),
            },
            (_, Some(error)) => RenderError::RuntimeThrow {
                name: error.name.clone(),
                message,
                stack: error.stack.clone(),
            },
            (_, None) => RenderError::RuntimeThrow {
                name: "Error".to_string(),
                message,
                stack: Vec::new(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
