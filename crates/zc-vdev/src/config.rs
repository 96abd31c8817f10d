//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use zc_error::{Result, ZcError};
use zc_types::{IoKind, IoPriority};

/// Concurrency floor and ceiling for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimits {
    pub min_active: u32,
    pub max_active: u32,
}

impl ClassLimits {
    #[must_use]
    pub const fn new(min_active: u32, max_active: u32) -> Self {
        Self {
            min_active,
            max_active,
        }
    }
}

/// Per-device queue configuration.
///
/// Defaults follow the reference pool's shipped values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdevQueueConfig {
    /// Device-wide cap on operations in flight.
    pub max_active: u32,
    /// Limits indexed by [`IoPriority::index`].
    pub classes: [ClassLimits; IoPriority::COUNT],
    /// Dirty-data percentage at which async write concurrency starts growing.
    pub async_write_min_dirty_pct: u32,
    /// Dirty-data percentage at which async write concurrency is maximal.
    pub async_write_max_dirty_pct: u32,
    /// Largest aggregated operation in bytes. Zero disables aggregation.
    pub aggregation_limit: u32,
    /// Largest hole bridged when aggregating reads.
    pub read_gap_limit: u32,
    /// Largest hole bridged when aggregating writes. Writes only merge when
    /// exactly adjacent, so the only accepted value is zero.
    pub write_gap_limit: u32,
}

impl Default for VdevQueueConfig {
    fn default() -> Self {
        Self {
            max_active: 1000,
            classes: [
                ClassLimits::new(10, 10),
                ClassLimits::new(10, 10),
                ClassLimits::new(1, 3),
                ClassLimits::new(1, 10),
                ClassLimits::new(1, 2),
            ],
            async_write_min_dirty_pct: 30,
            async_write_max_dirty_pct: 60,
            aggregation_limit: 128 * 1024,
            read_gap_limit: 32 * 1024,
            write_gap_limit: 0,
        }
    }
}

impl VdevQueueConfig {
    #[must_use]
    pub fn limits(&self, priority: IoPriority) -> ClassLimits {
        self.classes[priority.index()]
    }

    pub fn limits_mut(&mut self, priority: IoPriority) -> &mut ClassLimits {
        &mut self.classes[priority.index()]
    }

    /// Largest hole bridged when aggregating operations of `kind`.
    ///
    /// Always zero for writes: a merged write covers only bytes some member
    /// owns.
    #[must_use]
    pub fn gap_limit(&self, kind: IoKind) -> u32 {
        match kind {
            IoKind::Read => self.read_gap_limit,
            IoKind::Write => 0,
        }
    }

    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(invalid("max_active", "must be at least 1"));
        }
        for priority in IoPriority::ALL {
            let limits = self.limits(priority);
            if limits.max_active == 0 {
                return Err(invalid(
                    &format!("{priority}_max_active"),
                    "must be at least 1",
                ));
            }
            if limits.min_active > limits.max_active {
                return Err(invalid(
                    &format!("{priority}_min_active"),
                    &format!(
                        "min_active {} exceeds max_active {}",
                        limits.min_active, limits.max_active
                    ),
                ));
            }
        }
        if self.write_gap_limit != 0 {
            return Err(invalid(
                "write_gap_limit",
                "writes aggregate only when adjacent; holes are never written",
            ));
        }
        if self.async_write_max_dirty_pct > 100 {
            return Err(invalid("async_write_max_dirty_pct", "must be at most 100"));
        }
        if self.async_write_min_dirty_pct > self.async_write_max_dirty_pct {
            return Err(invalid(
                "async_write_min_dirty_pct",
                "must not exceed async_write_max_dirty_pct",
            ));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = VdevQueueConfig::default();
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.limits(IoPriority::AsyncRead), ClassLimits::new(1, 3));
        assert_eq!(cfg.limits(IoPriority::Scrub), ClassLimits::new(1, 2));
        assert_eq!(cfg.aggregation_limit, 131_072);
    }

    #[test]
    fn min_above_max_rejected() {
        let mut cfg = VdevQueueConfig::default();
        cfg.limits_mut(IoPriority::Scrub).min_active = 5;
        let err = cfg.validate().expect_err("min > max");
        assert!(
            matches!(err, ZcError::InvalidTunable { ref name, .. } if name == "scrub_min_active")
        );
    }

    #[test]
    fn zero_device_cap_rejected() {
        let cfg = VdevQueueConfig {
            max_active: 0,
            ..VdevQueueConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_dirty_band_rejected() {
        let cfg = VdevQueueConfig {
            async_write_min_dirty_pct: 70,
            async_write_max_dirty_pct: 60,
            ..VdevQueueConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_gap_must_stay_zero() {
        let cfg = VdevQueueConfig {
            write_gap_limit: 4096,
            ..VdevQueueConfig::default()
        };
        let err = cfg.validate().expect_err("write holes");
        assert!(
            matches!(err, ZcError::InvalidTunable { ref name, .. } if name == "write_gap_limit")
        );
    }
}
