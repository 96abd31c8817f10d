//! Throttle configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zc_error::{Result, ZcError};

/// Dirty-data limits and the shape of the admission delay curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Dirty bytes at which every writer waits the full `delay_max`.
    pub dirty_data_max: u64,
    /// Dirty bytes at which the pool should start a sync.
    pub dirty_data_sync: u64,
    /// Longest single admission delay.
    pub delay_max: Duration,
    /// Delays start once dirty data exceeds this percentage of `dirty_data_max`.
    pub delay_min_dirty_percent: u32,
    /// Nanoseconds of delay per unit of `(dirty - threshold) / (max - dirty)`.
    pub delay_scale: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            dirty_data_max: 4 * 1024 * 1024 * 1024,
            dirty_data_sync: 64 * 1024 * 1024,
            delay_max: Duration::from_millis(100),
            delay_min_dirty_percent: 60,
            delay_scale: 500_000,
        }
    }
}

impl ThrottleConfig {
    /// Dirty bytes below (and at) which writers are never delayed.
    #[must_use]
    pub fn delay_threshold(&self) -> u64 {
        let bytes = u128::from(self.dirty_data_max) * u128::from(self.delay_min_dirty_percent) / 100;
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dirty_data_max == 0 {
            return Err(invalid("zfs_dirty_data_max", "must be non-zero"));
        }
        if self.dirty_data_sync == 0 {
            return Err(invalid("zfs_dirty_data_sync", "must be non-zero"));
        }
        if self.delay_min_dirty_percent > 100 {
            return Err(invalid(
                "zfs_delay_min_dirty_percent",
                &format!("{} is above 100", self.delay_min_dirty_percent),
            ));
        }
        if self.delay_max.is_zero() {
            return Err(invalid("zfs_delay_max_ns", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> ZcError {
    ZcError::InvalidTunable {
        name: name.to_owned(),
        reason: reason.to_owned(),
    }
}
