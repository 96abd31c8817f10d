#![forbid(unsafe_code)]
//! Write throttle: per-pool dirty-data accounting and admission delay.
//!
//! Writers call [`DirtyDataController::wait_for_admission`] and then
//! [`DirtyDataController::account_write`]; the sync path calls
//! [`DirtyDataController::release`] once data is durable. The delay grows
//! with dirty data (see [`delay`]) so that writers slow down smoothly
//! instead of stalling when the pool fills.

use asupersync::Cx;
use zc_error::{Result, ZcError};

pub mod config;
pub mod controller;
pub mod delay;

pub use config::ThrottleConfig;
pub use controller::{DirtyDataController, ThrottleSnapshot};
pub use delay::admission_delay_for;

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ZcError::Cancelled)
}
