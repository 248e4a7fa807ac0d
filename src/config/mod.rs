//! Service configuration: host capacity caps and floors, sandbox defaults,
//! telemetry grace, and the advisory endpoint. Loaded once from TOML; every
//! section has serde defaults so an empty file is a valid config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::LimitBounds;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub advisory: AdvisoryConfig,
}

/// Host capacity: ceilings reject oversized requests at `start`, floors stop
/// governor penalties from starving a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_cpu_ceiling")]
    pub cpu_ceiling_percent: u32,

    #[serde(default = "default_cpu_floor")]
    pub cpu_floor_percent: u32,

    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling_mb: u32,

    #[serde(default = "default_memory_floor")]
    pub memory_floor_mb: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter the script is handed to.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Root directory for per-run workspaces (default: system temp).
    #[serde(default)]
    pub workdir_root: Option<PathBuf>,

    /// Grace between SIGTERM and SIGKILL when tearing a run down.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,

    /// Cap on the session output log, in bytes.
    #[serde(default = "default_max_output")]
    pub max_output_bytes: u64,

    /// RLIMIT_NPROC for the child.
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    /// RLIMIT_FSIZE for the child, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Upper bound on the declared time budget, in seconds.
    #[serde(default = "default_max_time_limit")]
    pub max_time_limit_secs: u64,

    /// Apply Landlock/seccomp hardening in the child (Linux).
    #[serde(default = "default_true")]
    pub harden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Missing samples for longer than this is an anomaly: the session is
    /// failed with a recorded cause.
    #[serde(default = "default_telemetry_grace")]
    pub grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// When enabled, an unreachable advisory blocks execution (fail closed).
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_advisory_timeout")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config {}", path.display()))?;
                let config: Config = toml::from_str(&raw)
                    .with_context(|| format!("cannot parse config {}", path.display()))?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    pub fn bounds(&self) -> LimitBounds {
        LimitBounds {
            cpu_floor_percent: self.host.cpu_floor_percent,
            cpu_ceiling_percent: self.host.cpu_ceiling_percent,
            memory_floor_mb: self.host.memory_floor_mb,
            memory_ceiling_mb: self.host.memory_ceiling_mb,
        }
    }

    pub fn workdir_root(&self) -> PathBuf {
        self.sandbox
            .workdir_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("watchbox"))
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.host.cpu_floor_percent > 0
                && self.host.cpu_floor_percent <= self.host.cpu_ceiling_percent,
            "host cpu floor/ceiling out of order"
        );
        anyhow::ensure!(
            self.host.memory_floor_mb > 0
                && self.host.memory_floor_mb <= self.host.memory_ceiling_mb,
            "host memory floor/ceiling out of order"
        );
        anyhow::ensure!(
            self.sandbox.max_time_limit_secs > 0,
            "sandbox max_time_limit_secs must be positive"
        );
        if self.advisory.enabled {
            anyhow::ensure!(
                !self.advisory.endpoint.is_empty(),
                "advisory enabled but no endpoint configured"
            );
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cpu_ceiling_percent: default_cpu_ceiling(),
            cpu_floor_percent: default_cpu_floor(),
            memory_ceiling_mb: default_memory_ceiling(),
            memory_floor_mb: default_memory_floor(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            workdir_root: None,
            kill_grace_ms: default_kill_grace(),
            max_output_bytes: default_max_output(),
            max_processes: default_max_processes(),
            max_file_size_bytes: default_max_file_size(),
            max_time_limit_secs: default_max_time_limit(),
            harden: default_true(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_telemetry_grace(),
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            timeout_ms: default_advisory_timeout(),
            api_key: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cpu_ceiling() -> u32 {
    100
}

fn default_cpu_floor() -> u32 {
    10
}

fn default_memory_ceiling() -> u32 {
    4096
}

fn default_memory_floor() -> u32 {
    32
}

fn default_interpreter() -> String {
    "/bin/sh".to_string()
}

fn default_kill_grace() -> u64 {
    500
}

fn default_max_output() -> u64 {
    1024 * 1024
}

fn default_max_processes() -> u32 {
    64
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_max_time_limit() -> u64 {
    300
}

fn default_telemetry_grace() -> u64 {
    2000
}

fn default_advisory_timeout() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.host.cpu_ceiling_percent, 100);
        assert_eq!(config.host.memory_floor_mb, 32);
        assert_eq!(config.sandbox.interpreter, "/bin/sh");
        assert!(!config.advisory.enabled);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config: Config = toml::from_str(
            r#"
            [host]
            memory_ceiling_mb = 1024

            [sandbox]
            kill_grace_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.host.memory_ceiling_mb, 1024);
        assert_eq!(config.sandbox.kill_grace_ms, 250);
        assert_eq!(config.host.cpu_ceiling_percent, 100);
    }

    #[test]
    fn load_rejects_inverted_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[host]\ncpu_floor_percent = 90\ncpu_ceiling_percent = 50\n",
        )
        .unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn advisory_enabled_requires_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[advisory]\nenabled = true\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
