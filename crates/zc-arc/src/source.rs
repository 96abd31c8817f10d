//! Where cache misses are read from.

use asupersync::Cx;
use std::sync::Arc;
use zc_error::Result;
use zc_types::{BlockKey, IoPriority};
use zc_vdev::{IoRequest, VdevSet};

/// Completion for a block read. Receives exactly `key.size` bytes on success.
pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// Asynchronous block reader behind the cache.
pub trait BlockSource: Send + Sync {
    /// Start reading `key` on behalf of `cx`. On `Ok` the callback fires
    /// exactly once; on `Err` the read was never started and the callback is
    /// dropped.
    fn read_block(
        &self,
        cx: &Cx,
        key: BlockKey,
        priority: IoPriority,
        done: ReadCallback,
    ) -> Result<()>;
}

/// Reads through the per-device scheduler.
#[derive(Debug, Clone)]
pub struct VdevSource {
    vdevs: Arc<VdevSet>,
}

impl VdevSource {
    #[must_use]
    pub fn new(vdevs: Arc<VdevSet>) -> Self {
        Self { vdevs }
    }
}

impl BlockSource for VdevSource {
    fn read_block(
        &self,
        cx: &Cx,
        key: BlockKey,
        priority: IoPriority,
        done: ReadCallback,
    ) -> Result<()> {
        self.vdevs.submit(
            cx,
            key.vdev,
            IoRequest::read(key.offset.0, key.size, priority, move |res| {
                done(res.map(|out| out.data));
            }),
        )
    }
}
