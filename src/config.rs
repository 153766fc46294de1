use crate::backend::RetryPolicy;
use crate::core::{Result, SyncError};
use std::time::Duration;

/// Engine configuration.
///
/// Defaults suit a latency-heavy backend: leases are renewed at half the
/// TTL by the sweep loop and become stealable after twice the TTL.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lease time-to-live. A lease older than `2 × lease_ttl` is stale.
    pub lease_ttl: Duration,

    /// Inactivity window after which the sweep loop force-saves and
    /// releases a session.
    pub session_timeout: Duration,

    /// Interval between autosave passes over all active sessions.
    pub autosave_interval: Duration,

    /// Interval between lease-renewal/timeout sweeps. `None` derives
    /// `lease_ttl / 2`.
    pub sweep_interval: Option<Duration>,

    /// Retry behavior for transient backend failures.
    pub retry: RetryPolicy,

    /// Capacity of the per-session backup ring of prior saved snapshots.
    pub backup_capacity: usize,

    /// Perform the backend conditional update even when nothing is dirty.
    pub force_noop_writes: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            session_timeout: Duration::from_secs(600),
            autosave_interval: Duration::from_secs(30),
            sweep_interval: None,
            retry: RetryPolicy::default(),
            backup_capacity: 5,
            force_noop_writes: false,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn autosave_interval(mut self, interval: Duration) -> Self {
        self.autosave_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backup_capacity(mut self, capacity: usize) -> Self {
        self.backup_capacity = capacity;
        self
    }

    pub fn force_noop_writes(mut self, force: bool) -> Self {
        self.force_noop_writes = force;
        self
    }

    /// Effective sweep interval: configured value or `lease_ttl / 2`, so a
    /// healthy session renews its lease at least twice per TTL.
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.lease_ttl / 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(SyncError::Config("lease_ttl must be > 0".to_string()));
        }
        if self.session_timeout.is_zero() {
            return Err(SyncError::Config("session_timeout must be > 0".to_string()));
        }
        if self.autosave_interval.is_zero() {
            return Err(SyncError::Config(
                "autosave_interval must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }
        if let Some(sweep) = self.sweep_interval {
            if sweep.is_zero() {
                return Err(SyncError::Config("sweep_interval must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = SyncConfig::new()
            .lease_ttl(Duration::from_secs(10))
            .session_timeout(Duration::from_secs(120))
            .backup_capacity(3);
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.session_timeout, Duration::from_secs(120));
        assert_eq!(config.backup_capacity, 3);
    }

    #[test]
    fn test_sweep_interval_derives_from_ttl() {
        let config = SyncConfig::new().lease_ttl(Duration::from_secs(20));
        assert_eq!(config.effective_sweep_interval(), Duration::from_secs(10));

        let explicit = config.sweep_interval(Duration::from_secs(3));
        assert_eq!(explicit.effective_sweep_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        assert!(
            SyncConfig::new()
                .lease_ttl(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SyncConfig::new()
                .autosave_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
