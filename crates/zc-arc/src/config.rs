//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zc_error::{Result, ZcError};

/// What `insert` does when no victim can be evicted to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionPolicy {
    /// Fail immediately with `OutOfCacheSpace`.
    Fail,
    /// Retry up to `attempts` more times, sleeping `backoff` in between,
    /// then fail with `OutOfCacheSpace`.
    Retry { attempts: u32, backoff: Duration },
}

/// Adaptive cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcConfig {
    /// Hard ceiling on resident bytes.
    pub c_max: u64,
    /// Floor for the adaptive target size.
    pub c_min: u64,
    /// Moderate memory pressure shrinks the target by `c >> shrink_shift`.
    pub shrink_shift: u32,
    /// Ghost-hit adaptation keeps `p` at least `c >> p_min_shift` away from
    /// both ends of `[0, c]`, so neither list is starved.
    pub p_min_shift: u32,
    /// After a shrink, the target does not grow again for this long.
    pub grow_retry: Duration,
    /// Expected block size; sizes the ghost lists.
    pub average_block_size: u64,
    /// A second hit on an MRU entry within this window keeps it in MRU.
    pub promote_after: Duration,
    /// Upper bound on eviction passes per memory-pressure event.
    pub reclaim_passes: u32,
    pub admission: AdmissionPolicy,
}

impl Default for ArcConfig {
    fn default() -> Self {
        Self {
            c_max: 256 * 1024 * 1024,
            c_min: 32 * 1024 * 1024,
            shrink_shift: 5,
            p_min_shift: 4,
            grow_retry: Duration::from_secs(5),
            average_block_size: 8 * 1024,
            promote_after: Duration::from_millis(62),
            reclaim_passes: 4,
            admission: AdmissionPolicy::Fail,
        }
    }
}

impl ArcConfig {
    /// Convenience constructor for a cache bounded at `c_max` bytes with a
    /// floor of one eighth of that.
    #[must_use]
    pub fn with_capacity(c_max: u64) -> Self {
        Self {
            c_max,
            c_min: c_max / 8,
            ..Self::default()
        }
    }

    /// Maximum number of entries each ghost list may hold.
    #[must_use]
    pub fn ghost_limit(&self) -> usize {
        let entries = self.c_max / self.average_block_size.max(1);
        usize::try_from(entries).unwrap_or(usize::MAX).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.c_max == 0 {
            return Err(invalid("zfs_arc_max", "must be non-zero"));
        }
        if self.c_min > self.c_max {
            return Err(invalid(
                "zfs_arc_min",
                &format!("{} exceeds zfs_arc_max {}", self.c_min, self.c_max),
            ));
        }
        if self.shrink_shift == 0 || self.shrink_shift >= 64 {
            return Err(invalid("zfs_arc_shrink_shift", "must be in 1..64"));
        }
        if self.p_min_shift == 0 || self.p_min_shift >= 64 {
            return Err(invalid("zfs_arc_p_min_shift", "must be in 1..64"));
        }
        if self.average_block_size == 0 {
            return Err(invalid("zfs_arc_average_blocksize", "must be non-zero"));
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
        let cfg = ArcConfig::default();
        cfg.validate().expect("valid");
        assert_eq!(cfg.shrink_shift, 5);
        assert_eq!(cfg.ghost_limit(), 32 * 1024);
    }

    #[test]
    fn ghost_limit_never_zero() {
        let cfg = ArcConfig::with_capacity(1000);
        assert_eq!(cfg.ghost_limit(), 1);
    }

    #[test]
    fn inconsistent_bounds_rejected() {
        let cfg = ArcConfig {
            c_min: 2048,
            c_max: 1024,
            ..ArcConfig::default()
        };
        let err = cfg.validate().expect_err("min > max");
        assert!(matches!(err, ZcError::InvalidTunable { ref name, .. } if name == "zfs_arc_min"));

        let cfg = ArcConfig {
            shrink_shift: 64,
            ..ArcConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn p_min_shift_bounds() {
        assert_eq!(ArcConfig::default().p_min_shift, 4);
        for bad in [0, 64] {
            let cfg = ArcConfig {
                p_min_shift: bad,
                ..ArcConfig::default()
            };
            let err = cfg.validate().expect_err("out of range");
            assert!(
                matches!(err, ZcError::InvalidTunable { ref name, .. } if name == "zfs_arc_p_min_shift")
            );
        }
    }
}
