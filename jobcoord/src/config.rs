// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

const FALLBACK_WORKERS: usize = 4;

/// Settings of a [`crate::job_engine::coordinator::JobCoordinator`].
///
/// Constructed once at process start and handed to the coordinator; there is
/// no process-wide copy of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoordinatorConfig {
    /// Number of worker slots, i.e. jobs that may run at the same time.
    pub workers: usize,
    /// A completion that has not resolved within this time counts as failed.
    /// `None` waits forever.
    pub completion_timeout_ms: Option<u64>,
    /// Delay before a failed attempt is re-run. `0` retries immediately.
    pub retry_backoff_ms: u64,
    pub shutdown_policy: ShutdownPolicy,
}

/// What happens to queued jobs that have not started yet when the coordinator shuts down.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize,
)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    #[default]
    /// Default: run every admitted job to its end
    Drain,
    /// Drop jobs that were not started yet, counting them as abandoned
    Discard,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_WORKERS);
        Self {
            workers,
            completion_timeout_ms: None,
            retry_backoff_ms: 0,
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout_ms = Some(whole_millis(timeout));
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = whole_millis(backoff);
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self) -> Option<Duration> {
        match self.retry_backoff_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".into());
        }
        if self.completion_timeout_ms == Some(0) {
            return Err("completion-timeout-ms must be positive when set".into());
        }
        Ok(())
    }

    /// Reads a JSON config file. Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: CoordinatorConfig = serde_json::from_str(raw)?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }
}

/// Milliseconds of `duration`, rounded up so that no nonzero duration becomes 0.
fn whole_millis(duration: Duration) -> u64 {
    let partial = duration.subsec_nanos() % 1_000_000 != 0;
    let millis = duration.as_millis() + u128::from(partial);
    u64::try_from(millis).unwrap_or(u64::MAX)
}
