#![forbid(unsafe_code)]
//! Storage pool core.
//!
//! Ties the adaptive replacement cache, the per-device I/O schedulers, and
//! the dirty-data write throttle into a [`StoragePool`], and re-exports the
//! component crates so consumers depend on this crate alone.

pub mod pool;

pub use pool::{PoolBuilder, PoolStats, StoragePool, SyncReport};

pub use asupersync::Cx;

pub use zc_arc::{
    AdmissionPolicy, ArcCache, ArcConfig, ArcHandle, ArcStats, BlockSource, ListId,
    MemoryPressure, ReclaimOutcome, VdevSource,
};
pub use zc_error::{Result, ZcError};
pub use zc_throttle::{DirtyDataController, ThrottleConfig, ThrottleSnapshot};
pub use zc_tunables::{ApplyReport, Component, TunableSnapshot, TunableTable, TunableValue};
pub use zc_types::{BlockKey, ByteOffset, ConfigCell, IoKind, IoPriority, PoolId, VdevId};
pub use zc_vdev::{
    DeviceBackend, FileDevice, IoOutcome, IoRequest, MemDevice, QueueSnapshot, VdevQueue,
    VdevQueueConfig, VdevSet, WorkerDevice,
};

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ZcError::Cancelled)
}
