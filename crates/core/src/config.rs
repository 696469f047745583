use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Smallest degree of parallelism a scheduler accepts.
pub const MIN_DEGREE_OF_PARALLELISM: usize = 2;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

// ── Substrate selection ───────────────────────────────────────

/// Which execution substrate launches worker loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    /// Dedicated rayon thread pool.
    #[default]
    Rayon,
    /// One OS thread per worker loop.
    Thread,
    /// `spawn_blocking` on the ambient tokio runtime.
    Tokio,
}

impl FromStr for SubstrateKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rayon" => Ok(SubstrateKind::Rayon),
            "thread" | "threads" => Ok(SubstrateKind::Thread),
            "tokio" => Ok(SubstrateKind::Tokio),
            other => Err(SchedulerError::InvalidConfiguration(format!(
                "unknown substrate '{other}' (expected rayon, thread or tokio)"
            ))),
        }
    }
}

impl fmt::Display for SubstrateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubstrateKind::Rayon => "rayon",
            SubstrateKind::Thread => "thread",
            SubstrateKind::Tokio => "tokio",
        };
        f.write_str(name)
    }
}

// ── Scheduler config ──────────────────────────────────────────

/// Scheduler configuration, parsed from TOML and/or the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently active worker loops. Must be >= 2.
    #[serde(default = "default_max_degree")]
    pub max_degree_of_parallelism: usize,
    /// How long a diagnostic queue snapshot may wait for the lock.
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_ms: u64,
    /// Substrate used to launch worker loops.
    #[serde(default)]
    pub substrate: SubstrateKind,
    /// Threads in a dedicated rayon pool. 0 = available parallelism.
    #[serde(default)]
    pub pool_threads: usize,
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_degree() -> usize {
    available_parallelism().max(MIN_DEGREE_OF_PARALLELISM)
}
fn default_snapshot_timeout() -> u64 { 50 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: default_max_degree(),
            snapshot_timeout_ms: default_snapshot_timeout(),
            substrate: SubstrateKind::default(),
            pool_threads: 0,
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Build config from defaults plus environment variables (loads `.env` first).
    ///
    /// Profile is read from `THROTTLE_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, SchedulerError> {
        load_dotenv();
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `THROTTLE_*` overrides for the profile named by `THROTTLE_PROFILE`.
    pub fn apply_env_overrides(&mut self) {
        let profile = env_or("THROTTLE_PROFILE", "").to_uppercase();
        self.apply_profile_overrides(&profile);
    }

    /// Apply `THROTTLE_*` overrides for an explicit profile (empty = default).
    pub fn apply_profile_overrides(&mut self, profile: &str) {
        let p = profile.to_uppercase();
        let p = p.as_str();
        if let Some(v) = profiled_env_parse(p, "THROTTLE_MAX_DEGREE_OF_PARALLELISM") {
            self.max_degree_of_parallelism = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_SNAPSHOT_TIMEOUT_MS") {
            self.snapshot_timeout_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_SUBSTRATE") {
            self.substrate = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_POOL_THREADS") {
            self.pool_threads = v;
        }
    }

    /// Reject values a scheduler cannot be built from.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_degree_of_parallelism < MIN_DEGREE_OF_PARALLELISM {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "max_degree_of_parallelism must be at least {}, got {}",
                MIN_DEGREE_OF_PARALLELISM, self.max_degree_of_parallelism
            )));
        }
        if self.snapshot_timeout_ms == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "snapshot_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Snapshot lock timeout as a [`Duration`].
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    /// Resolve pool thread count (0 means use available parallelism).
    pub fn resolved_pool_threads(&self) -> usize {
        if self.pool_threads == 0 {
            available_parallelism()
        } else {
            self.pool_threads
        }
    }

    /// Print a one-line summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            max_degree = self.max_degree_of_parallelism,
            substrate = %self.substrate,
            pool_threads = self.resolved_pool_threads(),
            snapshot_timeout_ms = self.snapshot_timeout_ms,
            "scheduler config loaded"
        );
    }
}
