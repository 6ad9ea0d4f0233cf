//! Typed configuration for both binaries, loaded from an optional TOML
//! file and layered under CLI flags (kubeconfig path today). One config
//! struct per process class rather than a single shared context.
//! `log_json` defaults from the `CI` env var, the same signal the
//! logger's own bootstrap checks.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
}

use thiserror::Error;

/// Shared settings used by both the controller and the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Kubeconfig path; `None` means in-cluster config.
    pub kubeconfig: Option<String>,
    /// NATS server URL(s), comma separated.
    pub nats_url: String,
    /// Dedup window applied to bus publishes. Default: 2 hours.
    #[serde(with = "humantime_duration")]
    pub dedup_window: Duration,
    /// Prometheus exporter bind address.
    pub metrics_listen_addr: String,
    /// Emit JSON logs (set automatically when the `CI` env var is present).
    pub log_json: bool,
}

impl Default for CommonConfig {
    fn default() -> Self {
        CommonConfig {
            kubeconfig: None,
            nats_url: "nats://localhost:4222".to_string(),
            dedup_window: Duration::from_secs(2 * 60 * 60),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            log_json: std::env::var_os("CI").is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Max ScanJobs retained per registry before garbage collection.
    pub scan_job_history_limit: usize,
    /// Tick period for the periodic schedule runner. Default: 1 minute.
    #[serde(with = "humantime_duration")]
    pub schedule_tick_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            common: CommonConfig::default(),
            scan_job_history_limit: 10,
            schedule_tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Max deliveries before a message is handed to the failure handler.
    pub max_attempts: u32,
    /// Base delay for the nak exponential backoff.
    #[serde(with = "humantime_duration")]
    pub retry_base_delay: Duration,
    /// Jitter fraction applied to the backoff delay, in `[0, 1]`.
    pub retry_jitter: f64,
    /// Working directory for SBOM/scan temp files and docker-config side channels.
    pub work_dir: String,
    /// Bounded number of in-flight handler tasks per worker process.
    pub max_concurrent_handlers: usize,
    /// Binary name/path for the external SBOM generator.
    pub sbom_tool_binary: String,
    /// Binary name/path for the external vulnerability scanner.
    pub scan_tool_binary: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            common: CommonConfig::default(),
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(10),
            retry_jitter: 0.2,
            work_dir: std::env::temp_dir().to_string_lossy().to_string(),
            max_concurrent_handlers: 16,
            sbom_tool_binary: "sbom-tool".to_string(),
            scan_tool_binary: "scan-tool".to_string(),
        }
    }
}

fn load<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, ConfigError> {
    let path = match path {
        Some(p) => p,
        None => return Ok(T::default()),
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
    toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
}

pub fn load_controller_config(path: Option<&Path>) -> Result<ControllerConfig, ConfigError> {
    load(path)
}

pub fn load_worker_config(path: Option<&Path>) -> Result<WorkerConfig, ConfigError> {
    load(path)
}

/// `serde_with`-style helper so config files can write durations as
/// `"90s"`/`"2h"` instead of raw nanosecond counts.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let (num, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len()));
        let num: u64 = num.parse().map_err(|_| format!("invalid duration: {raw}"))?;
        let secs = match unit {
            "" | "s" => num,
            "m" => num * 60,
            "h" => num * 3600,
            other => return Err(format!("unknown duration unit: {other}")),
        };
        Ok(Duration::from_secs(secs))
    }
}
