#![forbid(unsafe_code)]
//! Device layer: submission backends and the per-device I/O scheduler.
//!
//! - [`engine`]: the [`DeviceBackend`] trait plus in-memory, file, and
//!   worker-thread backends.
//! - [`queue`]: [`VdevQueue`], the priority-class scheduler with
//!   aggregation and removal.
//! - [`aggregate`]: aggregation geometry.
//! - [`set`]: [`VdevSet`], routing by [`VdevId`](zc_types::VdevId).

use asupersync::Cx;
use zc_error::{Result, ZcError};

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod queue;
pub mod set;

pub use config::{ClassLimits, VdevQueueConfig};
pub use engine::{
    DeviceBackend, DeviceCallback, DeviceOp, DeviceOutput, DeviceResult, DeviceStats, FileDevice,
    MemDevice, WorkerDevice,
};
pub use queue::{
    IoCallback, IoOutcome, IoRequest, QueueSnapshot, QueueStats, VdevQueue,
    scaled_async_write_max,
};
pub use set::VdevSet;

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ZcError::Cancelled)
}
