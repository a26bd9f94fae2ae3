//! Request façade: validate, spawn, and hand back the outward stream.

use crate::config::ExecutorConfig;
use crate::error::RenderError;
use crate::job::{CancelHandle, RenderJob};
use crate::multiplex::{self, RenderStream, StreamLimits};
use crate::runtime::RunnerJob;
use crate::supervisor;
use crate::template::{HtmlTemplate, DEFAULT_MOUNT_ID};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, Instrument};
use url::Url;

/// One render request.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Pre-built bundle entry module.
    pub entry_path: PathBuf,
    /// URL or absolute path the bundle sees as `location`.
    pub location: String,
    pub timeout_ms: u64,
    /// Root HTML file of the client build, wrapped around the markup.
    pub template: Option<PathBuf>,
    /// Id of the mount container inside `template`.
    pub mount_id: String,
    /// Directory modules may be loaded from (default: the entry's directory).
    pub bundle_root: Option<PathBuf>,
}

impl RenderRequest {
    pub fn new(entry_path: impl Into<PathBuf>, location: impl Into<String>) -> Self {
        Self {
            entry_path: entry_path.into(),
            location: location.into(),
            timeout_ms: 30_000,
            template: None,
            mount_id: DEFAULT_MOUNT_ID.to_string(),
            bundle_root: None,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn mount_id(mut self, mount_id: impl Into<String>) -> Self {
        self.mount_id = mount_id.into();
        self
    }

    pub fn bundle_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.bundle_root = Some(root.into());
        self
    }
}

/// Runs render jobs. Cheap to clone; jobs share nothing but configuration.
#[derive(Debug, Clone)]
pub struct Executor {
    config: Arc<ExecutorConfig>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn render(&self, request: RenderRequest) -> Result<RenderStream, RenderError> {
        self.render_with_cancel(request, CancelHandle::new()).await
    }

    /// Like `render`, but `cancel` ends the job early exactly as a timeout
    /// would. Dropping the returned future before it resolves also cancels.
    pub async fn render_with_cancel(
        &self,
        request: RenderRequest,
        cancel: CancelHandle,
    ) -> Result<RenderStream, RenderError> {
        let runner_job = self.validate(&request)?;
        let job = RenderJob::new(
            runner_job.entry.clone(),
            runner_job.location.clone(),
            Duration::from_millis(request.timeout_ms),
        );
        let span = info_span!("render_job", job_id = job.id(), entry = %job.entry_path().display());

        async move {
            tracing::info!(location = %job.location(), timeout_ms = request.timeout_ms, "render started");
            let guard = cancel.drop_guard();
            let runner = supervisor::spawn(&self.config, &runner_job, job.timeout(), cancel.clone())?;
            let limits = StreamLimits {
                chunk_size: self.config.chunk_size,
                capacity: self.config.stream_capacity,
                max_relay_record_bytes: self.config.max_relay_record_bytes,
            };
            let result = multiplex::assemble(job, runner, cancel, limits).await;
            guard.disarm();
            result
        }
        .instrument(span)
        .await
    }

    /// Everything that can be rejected before a runner exists.
    fn validate(&self, request: &RenderRequest) -> Result<RunnerJob, RenderError> {
        if request.timeout_ms == 0 {
            return Err(RenderError::Validation("timeout must be positive".into()));
        }

        let entry = request.entry_path.canonicalize().map_err(|e| {
            RenderError::Validation(format!(
                "entry '{}' does not exist: {}",
                request.entry_path.display(),
                e
            ))
        })?;
        if !entry.is_file() {
            return Err(RenderError::Validation(format!(
                "entry '{}' is not a file",
                entry.display()
            )));
        }

        let bundle_root = match &request.bundle_root {
            Some(root) => root.canonicalize().map_err(|e| {
                RenderError::Validation(format!("bundle root '{}' does not exist: {}", root.display(), e))
            })?,
            None => entry
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| RenderError::Validation("entry has no parent directory".into()))?,
        };
        if !entry.starts_with(&bundle_root) {
            return Err(RenderError::Validation(format!(
                "entry '{}' is outside bundle root '{}'",
                entry.display(),
                bundle_root.display()
            )));
        }

        let location = normalize_location(&request.location, &self.config.location_base)?;

        let template = match &request.template {
            Some(path) => Some(load_template(path, &request.mount_id)?),
            None => None,
        };

        Ok(RunnerJob {
            entry,
            bundle_root,
            location,
            template,
            timeout_ms: request.timeout_ms,
            allowed_origins: self.config.allowed_origins.clone(),
            max_heap_size: self.config.max_heap_size,
        })
    }
}

/// Render with the default configuration.
pub async fn render_job(request: RenderRequest) -> Result<RenderStream, RenderError> {
    Executor::default().render(request).await
}

/// Absolute http(s) URL for `location`; bare paths resolve against `base`.
pub fn normalize_location(location: &str, base: &str) -> Result<String, RenderError> {
    let invalid = |reason: &str| RenderError::Validation(format!("location '{}' {}", location, reason));

    if location.is_empty() {
        return Err(invalid("is empty"));
    }
    if location.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("contains whitespace or control characters"));
    }

    let url = if location.starts_with('/') && !location.starts_with("//") {
        let base = Url::parse(base).map_err(|e| invalid(&format!("has an unusable base: {}", e)))?;
        base.join(location).map_err(|e| invalid(&e.to_string()))?
    } else {
        Url::parse(location).map_err(|e| invalid(&format!("is not a URL or absolute path: {}", e)))?
    };

    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(invalid(&format!("has unsupported scheme '{}'", other))),
    }
}

fn load_template(path: &Path, mount_id: &str) -> Result<HtmlTemplate, RenderError> {
    let html = std::fs::read_to_string(path).map_err(|e| {
        RenderError::Validation(format!("template '{}' unreadable: {}", path.display(), e))
    })?;
    let template = HtmlTemplate::parse(&html, mount_id).map_err(|reason| RenderError::MalformedTemplate {
        path: path.to_path_buf(),
        reason,
    })?;
    match &template.script_src {
        Some(src) => tracing::debug!(template = %path.display(), script = %src, "template loaded"),
        None => tracing::warn!(template = %path.display(), "template has no client script, page will not hydrate"),
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://localhost";

    #[test]
    fn test_paths_resolve_against_base() {
        assert_eq!(
            normalize_location("/blog?page=2", BASE).unwrap(),
            "http://localhost/blog?page=2"
        );
        assert_eq!(
            normalize_location("https://shop.example.com/cart", BASE).unwrap(),
            "https://shop.example.com/cart"
        );
    }

    #[test]
    fn test_bad_locations() {
        for location in ["", "relative/path", "/with space", "javascript:alert(1)", "//evil.com/x", "/a\u{0}b"] {
            assert!(
                matches!(normalize_location(location, BASE), Err(RenderError::Validation(_))),
                "{:?}",
                location
            );
        }
    }
}
