//! Configuration management
//!
//! Defaults, then an optional TOML file (`--config` or `SKILLGATE_CONFIG`),
//! then `SKILLGATE_*` environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::skills::{ArchiveLimits, GateSettings, InvocationPolicy, SandboxConfig};

const MIB: u64 = 1024 * 1024;

/// Gate configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Archive size, member and expansion caps
    pub limits: ArchiveLimits,

    /// Sandbox wall-clock deadline
    pub sandbox_timeout: Duration,

    /// Interpreter used by the sandbox
    pub python: String,

    /// Staging copies and sandbox scratch directories
    pub work_dir: PathBuf,

    /// Approved skills
    pub install_dir: PathBuf,

    /// SQLite quarantine database
    pub quarantine_db: PathBuf,

    /// Maximum quarantine entries kept
    pub quarantine_capacity: usize,

    /// Call-time invocation policy
    pub invocation_policy: InvocationPolicy,
}

/// Optional TOML overrides, same names as the environment variables
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub zip_max_mb: Option<u64>,
    pub zip_max_files: Option<usize>,
    pub zip_max_uncompressed_mb: Option<u64>,
    pub sandbox_timeout: Option<f64>,
    pub python: Option<String>,
    pub work_dir: Option<String>,
    pub install_dir: Option<String>,
    pub quarantine_db: Option<String>,
    pub quarantine_capacity: Option<usize>,
    pub invocation_policy: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse TOML")
    }
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skillgate")
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn positive_secs(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

impl Default for Config {
    fn default() -> Self {
        let root = data_root();
        Self {
            limits: ArchiveLimits::default(),
            sandbox_timeout: Duration::from_secs(4),
            python: "python3".to_string(),
            work_dir: root.join("work"),
            install_dir: root.join("installed"),
            quarantine_db: root.join("quarantine.db"),
            quarantine_capacity: crate::skills::quarantine::DEFAULT_CAPACITY,
            invocation_policy: InvocationPolicy::TrustInstall,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `SKILLGATE_CONFIG`)
    pub fn from_env() -> Result<Self> {
        let file = std::env::var("SKILLGATE_CONFIG").ok().map(|p| expand(&p));
        Self::load(file.as_deref())
    }

    /// Load with an explicit config file, still honoring the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(path) => Some(FileConfig::load(path)?),
            None => None,
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// Merge defaults, a parsed file and an environment lookup
    pub fn from_sources(file: Option<FileConfig>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(file) = file {
            if let Some(mb) = file.zip_max_mb {
                config.limits.max_archive_bytes = mb * MIB;
            }
            if let Some(n) = file.zip_max_files {
                config.limits.max_members = n;
            }
            if let Some(mb) = file.zip_max_uncompressed_mb {
                config.limits.max_uncompressed_bytes = mb * MIB;
            }
            if let Some(t) = file.sandbox_timeout.and_then(positive_secs) {
                config.sandbox_timeout = t;
            }
            if let Some(python) = file.python {
                config.python = python;
            }
            if let Some(p) = file.work_dir {
                config.work_dir = expand(&p);
            }
            if let Some(p) = file.install_dir {
                config.install_dir = expand(&p);
            }
            if let Some(p) = file.quarantine_db {
                config.quarantine_db = expand(&p);
            }
            if let Some(n) = file.quarantine_capacity {
                config.quarantine_capacity = n.max(1);
            }
            if let Some(policy) = file.invocation_policy.as_deref().and_then(InvocationPolicy::parse) {
                config.invocation_policy = policy;
            }
        }

        if let Some(mb) = env("SKILLGATE_ZIP_MAX_MB").and_then(|v| v.parse::<u64>().ok()) {
            config.limits.max_archive_bytes = mb * MIB;
        }
        if let Some(n) = env("SKILLGATE_ZIP_MAX_FILES").and_then(|v| v.parse().ok()) {
            config.limits.max_members = n;
        }
        if let Some(mb) = env("SKILLGATE_ZIP_MAX_UNCOMPRESSED_MB").and_then(|v| v.parse::<u64>().ok()) {
            config.limits.max_uncompressed_bytes = mb * MIB;
        }
        if let Some(t) = env("SKILLGATE_SANDBOX_TIMEOUT")
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(positive_secs)
        {
            config.sandbox_timeout = t;
        }
        if let Some(python) = env("SKILLGATE_PYTHON").filter(|v| !v.trim().is_empty()) {
            config.python = python;
        }
        if let Some(p) = env("SKILLGATE_WORK_DIR") {
            config.work_dir = expand(&p);
        }
        if let Some(p) = env("SKILLGATE_INSTALL_DIR") {
            config.install_dir = expand(&p);
        }
        if let Some(p) = env("SKILLGATE_QUARANTINE_DB") {
            config.quarantine_db = expand(&p);
        }
        if let Some(n) = env("SKILLGATE_QUARANTINE_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            config.quarantine_capacity = n.max(1);
        }
        if let Some(policy) = env("SKILLGATE_INVOCATION_POLICY").and_then(|v| InvocationPolicy::parse(&v)) {
            config.invocation_policy = policy;
        }

        config
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            python: self.python.clone(),
            timeout: self.sandbox_timeout,
            work_dir: self.work_dir.clone(),
            ..Default::default()
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            limits: self.limits,
            sandbox_timeout: self.sandbox_timeout,
            work_dir: self.work_dir.clone(),
            install_root: self.install_dir.clone(),
        }
    }

    /// Ledger receiving released quarantine entries
    pub fn release_ledger_path(&self) -> PathBuf {
        self.install_dir.join("released.jsonl")
    }
}
