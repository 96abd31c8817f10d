//! The admission delay curve.
//!
//! ```text
//! delay
//!  max ┤                                   ┌──
//!      │                                 ╭─┘
//!      │                              ╭──╯
//!      │                        ╭─────╯
//!    0 ┼────────────────────────╯
//!      0                    threshold      dirty_data_max
//! ```
//!
//! Between the threshold and `dirty_data_max` the delay is
//! `delay_scale * (dirty - threshold) / (dirty_data_max - dirty)` ns, which
//! is zero at the threshold and grows without bound near the maximum; it is
//! capped at `delay_max`. Writers settle where the delay matches the rate
//! at which sync drains dirty data.

use crate::config::ThrottleConfig;
use std::time::Duration;

/// Delay a writer owes when the pool holds `dirty` bytes.
#[must_use]
pub fn admission_delay_for(cfg: &ThrottleConfig, dirty: u64) -> Duration {
    let threshold = cfg.delay_threshold();
    if dirty <= threshold {
        return Duration::ZERO;
    }
    if dirty >= cfg.dirty_data_max {
        return cfg.delay_max;
    }
    let numerator = u128::from(cfg.delay_scale) * u128::from(dirty - threshold);
    let denominator = u128::from(cfg.dirty_data_max - dirty);
    let nanos = numerator / denominator;
    let cap = cfg.delay_max.as_nanos();
    Duration::from_nanos(u64::try_from(nanos.min(cap)).unwrap_or(u64::MAX))
}
