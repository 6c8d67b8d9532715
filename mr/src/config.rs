use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::error::{MrError, Result};

pub const STORAGE_CONN_VAR: &str = "MR_STORAGE_CONN";
pub const FALLBACK_STORAGE_CONN_VAR: &str = "AzureWebJobsStorage";
pub const CONTAINER_VAR: &str = "MR_CONTAINER";
pub const DEFAULT_CONTAINER: &str = "mrinputs";

/// Object store settings. Built once at startup; a missing connection
/// string is an error there rather than inside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub connection: String,
    pub default_container: String,
}

impl StoreConfig {
    pub fn new(connection: Option<String>, default_container: Option<String>) -> Result<Self> {
        let connection = connection
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                MrError::Configuration(format!(
                    "missing {} or {}",
                    STORAGE_CONN_VAR, FALLBACK_STORAGE_CONN_VAR
                ))
            })?;
        let default_container = default_container
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
        Ok(StoreConfig {
            connection,
            default_container,
        })
    }

    pub fn from_env() -> Result<Self> {
        let connection = std::env::var(STORAGE_CONN_VAR)
            .ok()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| std::env::var(FALLBACK_STORAGE_CONN_VAR).ok());
        StoreConfig::new(connection, std::env::var(CONTAINER_VAR).ok())
    }
}

/// Retry policy applied by the host to transient activity failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        if self.jitter && !base.is_zero() {
            // up to +50%
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
            (base + Duration::from_millis(extra)).min(self.max_backoff)
        } else {
            base
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub retry: RetryPolicy,
    /// Upper bound on activities executing at the same time.
    pub max_in_flight: usize,
    /// Where checkpoint logs are written. `None` keeps them in memory only.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            retry: RetryPolicy::default(),
            max_in_flight: 64,
            checkpoint_dir: None,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(MrError::Configuration(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MrError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
