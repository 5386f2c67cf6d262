//! Engine configuration.
//!
//! Loaded from `~/.config/pipewright/engine.toml` (XDG on Linux). Every field
//! has a default, so a missing file or a partial file both work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use pipewright_types::{BufferMode, BufferPolicy, DEFAULT_LINE_CAPACITY, DEFAULT_PIPE_CAPACITY};

/// Tunables for pipelines and parallel groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Byte capacity of `bytes` edges.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Line capacity of `lines` edges.
    #[serde(default = "default_line_capacity")]
    pub line_capacity: usize,

    /// Policy for edges whose producer doesn't pick one.
    #[serde(default)]
    pub default_buffer: BufferMode,

    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// How many trailing stderr bytes each node keeps for its report.
    #[serde(default = "default_stderr_sample_bytes")]
    pub stderr_sample_bytes: usize,

    /// Concurrency limit for parallel groups (default: host parallelism).
    #[serde(default)]
    pub group_limit: Option<usize>,

    /// Cancel the remaining group members on the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_pipe_capacity() -> usize {
    DEFAULT_PIPE_CAPACITY
}

fn default_line_capacity() -> usize {
    DEFAULT_LINE_CAPACITY
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

fn default_stderr_sample_bytes() -> usize {
    4 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: default_pipe_capacity(),
            line_capacity: default_line_capacity(),
            default_buffer: BufferMode::default(),
            kill_grace_ms: default_kill_grace_ms(),
            stderr_sample_bytes: default_stderr_sample_bytes(),
            group_limit: None,
            fail_fast: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Get the default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "pipewright")
            .context("Could not determine config directory")?;

        Ok(dirs.config_dir().join("engine.toml"))
    }

    /// Buffering policy for edges that don't override it.
    pub fn default_policy(&self) -> BufferPolicy {
        BufferPolicy::from_mode(self.default_buffer, self.pipe_capacity, self.line_capacity)
    }

    /// Grace period for kill escalation.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Effective concurrency limit for parallel groups.
    pub fn group_limit(&self) -> usize {
        self.group_limit
            .filter(|n| *n > 0)
            .unwrap_or_else(host_parallelism)
    }
}

/// Number of execution units available to this process.
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.pipe_capacity, 64 * 1024);
        assert_eq!(config.kill_grace(), Duration::from_secs(2));
        assert!(config.group_limit() >= 1);
        assert_eq!(config.default_policy(), BufferPolicy::Bytes { capacity: 64 * 1024 });
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kill_grace_ms = 250\ndefault_buffer = \"lines\"\nline_capacity = 16").unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.kill_grace_ms, 250);
        assert_eq!(config.default_policy(), BufferPolicy::Lines { capacity: 16 });
        assert_eq!(config.stderr_sample_bytes, 4096);
    }

    #[test]
    fn zero_group_limit_falls_back_to_host() {
        let config = EngineConfig {
            group_limit: Some(0),
            ..Default::default()
        };
        assert_eq!(config.group_limit(), host_parallelism());
    }

    #[test]
    fn malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pipe_capacity = \"lots\"").unwrap();

        let err = EngineConfig::load_from(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }
}
