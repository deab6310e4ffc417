//! TOML configuration for the `jobs` binary.
//!
//! ```toml
//! [log]
//! format = "json"
//! level = "info,jobs_core=debug"
//!
//! [worker]
//! command = ["php", "worker.php"]
//! timeout = "2m"
//!
//! [jobs]
//! grace_period = "30s"
//!
//! [[jobs.pipelines]]
//! name = "emails"
//! driver = "ephemeral"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use jobs_core::JobsConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub worker: WorkerConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,

    /// Default filter; `RUST_LOG` wins when set.
    pub level: String,

    /// How often `serve` logs pipeline stats (0 disables).
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// The process run for each job: payload on stdin, metadata in the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program and arguments.
    pub command: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout: Duration::from_secs(60),
            env: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.jobs.validate()?;
        Ok(config)
    }
}
