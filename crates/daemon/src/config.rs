// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration.

use kiln_core::JobsetName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse config {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

/// All daemon knobs, loadable from a TOML file. Every field has a
/// default so an empty file (or none at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Postgres connection string.
    pub db_url: String,
    /// Root of the daemon's on-disk state.
    pub state_dir: PathBuf,
    /// Machine list file, reloaded while running.
    pub machines_file: PathBuf,
    /// Platform of the daemon host, used for `builtin:` derivations and
    /// as the default system type of machine-file entries.
    pub this_system: String,
    pub max_db_connections: u32,
    /// Fallback poll interval of the queue monitor when no notification
    /// arrives, seconds.
    pub queue_poll_secs: u64,
    /// Dispatcher idle interval, seconds.
    pub dispatch_idle_secs: u64,
    pub machines_reload_secs: u64,
    pub metrics_interval_secs: u64,
    /// Retries per step on retryable failures.
    pub max_tries: u32,
    pub retry_interval_secs: u64,
    /// Geometric factor on the retry delay.
    pub retry_backoff: f64,
    /// Fail runnable steps whose system type no live machine supports
    /// for this long. Zero disables the rule.
    pub max_unsupported_secs: u64,
    /// Base cooldown after a machine transport failure, doubled per
    /// consecutive failure.
    pub machine_cooldown_secs: u64,
    /// Bounded wait for a machine's send lock before requeueing.
    pub send_lock_timeout_secs: u64,
    /// Closure uploads in flight across all machines.
    pub max_parallel_copy_closure: usize,
    /// Permits of the local-work throttle; zero means the number of
    /// available cores.
    pub local_workers: usize,
    /// Maximum build log size passed to the remote, bytes.
    pub max_log_size: u64,
    /// Fair-share accounting window, seconds.
    pub scheduling_window_secs: u64,
    /// Record permanent build failures in the failure cache.
    pub cache_failures: bool,
    /// Determinism repeats per jobset, keyed `project:jobset`.
    pub jobset_repeats: HashMap<String, u32>,
    /// Exit after finishing this build (testing aid, set from the CLI).
    #[serde(skip)]
    pub build_one: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::state_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kiln");
        Self {
            db_url: "postgres://localhost/kiln".to_string(),
            machines_file: state_dir.join("machines"),
            state_dir,
            this_system: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            max_db_connections: 8,
            queue_poll_secs: 60,
            dispatch_idle_secs: 60,
            machines_reload_secs: 30,
            metrics_interval_secs: 600,
            max_tries: 5,
            retry_interval_secs: 60,
            retry_backoff: 3.0,
            max_unsupported_secs: 120,
            machine_cooldown_secs: 30,
            send_lock_timeout_secs: 60,
            max_parallel_copy_closure: 4,
            local_workers: 0,
            max_log_size: 64 << 20,
            scheduling_window_secs: 24 * 60 * 60,
            cache_failures: false,
            jobset_repeats: HashMap::new(),
            build_one: None,
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else { return Ok(Self::default()) };
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("kilnd.lock")
    }

    pub fn status_file(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("kilnd.log")
    }

    pub fn roots_dir(&self) -> PathBuf {
        self.state_dir.join("roots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_secs(self.queue_poll_secs.max(1))
    }

    pub fn dispatch_idle_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_idle_secs.max(1))
    }

    pub fn machines_reload_interval(&self) -> Duration {
        Duration::from_secs(self.machines_reload_secs.max(1))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    pub fn machine_cooldown(&self) -> Duration {
        Duration::from_secs(self.machine_cooldown_secs.max(1))
    }

    pub fn send_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.send_lock_timeout_secs.max(1))
    }

    /// `None` disables the unsupported-step rule.
    pub fn max_unsupported_time(&self) -> Option<Duration> {
        (self.max_unsupported_secs > 0).then(|| Duration::from_secs(self.max_unsupported_secs))
    }

    /// Delay before retry number `tries` (1-based), geometric in
    /// `retry_backoff`.
    pub fn retry_delay(&self, tries: u32) -> Duration {
        let base = self.retry_interval_secs.max(1) as f64;
        let factor = self.retry_backoff.max(1.0).powi(tries.saturating_sub(1) as i32);
        Duration::from_secs((base * factor) as u64)
    }

    pub fn local_worker_permits(&self) -> usize {
        if self.local_workers > 0 {
            self.local_workers
        } else {
            std::thread::available_parallelism().map(usize::from).unwrap_or(4)
        }
    }

    pub fn repeats_for(&self, jobset: &JobsetName) -> u32 {
        self.jobset_repeats.get(&jobset.to_string()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
