use anyhow::{bail, Result};
use serde::Deserialize;

fn default_lock_duration_secs() -> u64 {
    150
}

fn default_lock_refresh_interval_secs() -> u64 {
    50
}

fn default_lock_check_interval_ms() -> u64 {
    2_000
}

fn default_read_retry_backoff_secs() -> Vec<u64> {
    vec![1, 5, 30]
}

fn default_list_pool_size() -> usize {
    256
}

fn default_list_job_timeout_secs() -> u64 {
    60
}

fn default_max_concurrency() -> u32 {
    64
}

/// Store-level tunables. Every field has a production default; embedders
/// only override them for tests or unusual backends.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// How long a lock file stays authoritative without a refresh.
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    /// Refresh cadence while a lock is held. Must stay well under the
    /// expiry horizon.
    #[serde(default = "default_lock_refresh_interval_secs")]
    pub lock_refresh_interval_secs: u64,
    #[serde(default = "default_lock_check_interval_ms")]
    pub lock_check_interval_ms: u64,
    /// Sleep schedule between attempts for transient object reads.
    #[serde(default = "default_read_retry_backoff_secs")]
    pub read_retry_backoff_secs: Vec<u64>,
    #[serde(default = "default_list_pool_size")]
    pub list_pool_size: usize,
    #[serde(default = "default_list_job_timeout_secs")]
    pub list_job_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_duration_secs: default_lock_duration_secs(),
            lock_refresh_interval_secs: default_lock_refresh_interval_secs(),
            lock_check_interval_ms: default_lock_check_interval_ms(),
            read_retry_backoff_secs: default_read_retry_backoff_secs(),
            list_pool_size: default_list_pool_size(),
            list_job_timeout_secs: default_list_job_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_duration_secs == 0 {
            bail!("lock_duration_secs must be > 0");
        }
        if self.lock_refresh_interval_secs == 0 {
            bail!("lock_refresh_interval_secs must be > 0");
        }
        if self.lock_refresh_interval_secs > self.lock_duration_secs / 3 {
            bail!(
                "lock_refresh_interval_secs must be <= lock_duration_secs / 3 ({})",
                self.lock_duration_secs / 3
            );
        }
        if self.lock_check_interval_ms == 0 {
            bail!("lock_check_interval_ms must be > 0");
        }
        if self.list_pool_size == 0 {
            bail!("list_pool_size must be > 0");
        }
        if self.list_job_timeout_secs == 0 {
            bail!("list_job_timeout_secs must be > 0");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be > 0");
        }
        Ok(())
    }

    /// Clamp a caller-provided worker count into `[1, max_concurrency]`.
    pub fn clamp_concurrency(&self, requested: u32) -> usize {
        requested.clamp(1, self.max_concurrency) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StoreConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn refresh_interval_must_leave_expiry_headroom() {
        let config = StoreConfig {
            lock_refresh_interval_secs: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn concurrency_is_clamped() {
        let config = StoreConfig::default();
        assert_eq!(config.clamp_concurrency(0), 1);
        assert_eq!(config.clamp_concurrency(5), 5);
        assert_eq!(config.clamp_concurrency(500), 64);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"lock_duration_secs": 30, "lock_refresh_interval_secs": 10}"#)
                .expect("parse should succeed");
        assert_eq!(config.lock_duration_secs, 30);
        assert_eq!(config.list_pool_size, 256);
        config.validate().expect("partial config must validate");
    }
}
