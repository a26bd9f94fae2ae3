//! Executor configuration.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How to start a runner process.
///
/// The child gets exactly `env` as its environment; nothing is inherited.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl RunnerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The running executable in `runner` mode.
    pub fn current_exe() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ssr-relay"));
        Self::new(program).arg("runner")
    }
}

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub runner: RunnerCommand,
    /// Time between SIGTERM and SIGKILL when a runner overruns
    pub kill_grace: Duration,
    /// V8 heap ceiling for the runner (None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Origins the bundle may fetch() from (empty = fetch disabled)
    pub allowed_origins: Vec<String>,
    /// Base URL for locations given as a bare path
    pub location_base: String,
    /// Read size for the markup channel
    pub chunk_size: usize,
    /// Chunks buffered towards the consumer before backpressure applies
    pub stream_capacity: usize,
    /// Largest relayed record payload; bigger records are dropped
    pub max_relay_record_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            runner: RunnerCommand::current_exe(),
            kill_grace: Duration::from_secs(2),
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            allowed_origins: vec![],               // fetch disabled by default
            location_base: String::from("http://localhost"),
            chunk_size: 8 * 1024,
            stream_capacity: 16,
            max_relay_record_bytes: 64 * 1024,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `SSR_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(program) = lookup("SSR_RELAY_RUNNER") {
            config.runner.program = PathBuf::from(program);
        }
        if let Some(ms) = lookup("SSR_RELAY_KILL_GRACE_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("SSR_RELAY_KILL_GRACE_MS: invalid value '{}'", ms))?;
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(mb) = lookup("SSR_RELAY_MAX_HEAP_MB") {
            let mb: usize = mb
                .trim()
                .parse()
                .with_context(|| format!("SSR_RELAY_MAX_HEAP_MB: invalid value '{}'", mb))?;
            config.max_heap_size = (mb > 0).then(|| mb * 1024 * 1024);
        }
        if let Some(origins) = lookup("SSR_RELAY_ALLOWED_ORIGINS") {
            config.allowed_origins = parse_origins(&origins)?;
        }
        if let Some(base) = lookup("SSR_RELAY_LOCATION_BASE") {
            url::Url::parse(&base)
                .map_err(|e| anyhow!("SSR_RELAY_LOCATION_BASE: invalid URL '{}': {}", base, e))?;
            config.location_base = base;
        }

        Ok(config)
    }
}

/// Parse a comma separated origin list, normalizing each entry to its
/// `scheme://host[:port]` serialization.
pub fn parse_origins(list: &str) -> Result<Vec<String>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let url = url::Url::parse(s).map_err(|e| anyhow!("invalid origin '{}': {}", s, e))?;
            let origin = url.origin();
            if !origin.is_tuple() {
                return Err(anyhow!("'{}' has no usable origin", s));
            }
            Ok(origin.ascii_serialization())
        })
        .collect()
}
