//! A storage pool: devices behind per-device queues, the adaptive cache in
//! front of them, and the write throttle pacing writers.
//!
//! # Cancellation
//!
//! Every I/O entry point takes the caller's [`Cx`]. A cancelled context
//! fails the call with `Cancelled`: before any work for reads, writes, and
//! syncs, and while a writer sleeps in the throttle. A sync cancelled
//! part-way keeps the unwritten entries dirty and their bytes accounted,
//! exactly like a failed device write.
//!
//! # Logging
//!
//! - **TRACE** `zc::pool`: `pool_write`
//! - **DEBUG** `zc::pool`: `pool_sync`, `pool_write_needs_room`, `pool_unregister_failed`
//! - **INFO**  `zc::pool`: `pool_open`, `pool_device_removed`, `pool_shutdown`
//! - **WARN**  `zc::pool`: `pool_sync_failed`

use crate::cx_checkpoint;
use asupersync::Cx;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use tracing::{debug, info, trace, warn};
use zc_arc::{ArcCache, ArcConfig, ArcHandle, ArcStats, MemoryPressure, ReclaimOutcome, VdevSource};
use zc_error::{Result, ZcError};
use zc_throttle::{DirtyDataController, ThrottleConfig, ThrottleSnapshot};
use zc_tunables::TunableTable;
use zc_types::{BlockKey, ConfigCell, IoPriority, PoolId, VdevId};
use zc_vdev::{DeviceBackend, IoRequest, QueueSnapshot, VdevQueueConfig, VdevSet};

/// Assembles a [`StoragePool`].
pub struct PoolBuilder {
    id: PoolId,
    arc: ArcConfig,
    queue: VdevQueueConfig,
    throttle: ThrottleConfig,
    controller: Option<Arc<DirtyDataController>>,
    devices: Vec<(VdevId, Arc<dyn DeviceBackend>)>,
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("id", &self.id)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl PoolBuilder {
    #[must_use]
    pub fn new(id: PoolId) -> Self {
        Self {
            id,
            arc: ArcConfig::default(),
            queue: VdevQueueConfig::default(),
            throttle: ThrottleConfig::default(),
            controller: None,
            devices: Vec::new(),
        }
    }

    #[must_use]
    pub fn arc_config(mut self, cfg: ArcConfig) -> Self {
        self.arc = cfg;
        self
    }

    #[must_use]
    pub fn queue_config(mut self, cfg: VdevQueueConfig) -> Self {
        self.queue = cfg;
        self
    }

    /// Throttle limits for a pool-private controller. Ignored when a shared
    /// controller is supplied.
    #[must_use]
    pub fn throttle_config(mut self, cfg: ThrottleConfig) -> Self {
        self.throttle = cfg;
        self
    }

    /// Account this pool's dirty data in a controller shared with other pools.
    #[must_use]
    pub fn shared_throttle(mut self, controller: Arc<DirtyDataController>) -> Self {
        self.controller = Some(controller);
        self
    }

    #[must_use]
    pub fn device(mut self, vdev: VdevId, backend: Arc<dyn DeviceBackend>) -> Self {
        self.devices.push((vdev, backend));
        self
    }

    pub fn build(mut self) -> Result<StoragePool> {
        self.queue.validate()?;
        let throttle = match self.controller.take() {
            Some(shared) => shared,
            None => Arc::new(DirtyDataController::new(Arc::new(ConfigCell::new(
                "throttle",
                self.throttle.clone(),
            )))?),
        };
        throttle.register_pool(self.id)?;
        let id = self.id;
        self.assemble(Arc::clone(&throttle)).inspect_err(|_| {
            // Leave a shared controller as it was.
            let _ = throttle.unregister_pool(id);
        })
    }

    fn assemble(self, throttle: Arc<DirtyDataController>) -> Result<StoragePool> {
        let queue_cfg = Arc::new(ConfigCell::new("vdev_queue", self.queue));
        let vdevs = Arc::new(VdevSet::new(
            Arc::clone(&queue_cfg),
            Some(throttle.gauge(self.id)?),
        ));
        for (vdev, backend) in self.devices {
            vdevs.attach(vdev, backend)?;
        }

        let arc_cfg = Arc::new(ConfigCell::new("arc", self.arc));
        let cache = ArcCache::new(
            Arc::clone(&arc_cfg),
            Arc::new(VdevSource::new(Arc::clone(&vdevs))),
        )?;
        let tunables = TunableTable::new(arc_cfg, queue_cfg, Arc::clone(throttle.config()))
            .with_vdevs(Arc::clone(&vdevs));

        info!(
            target: "zc::pool",
            pool = self.id.0,
            devices = vdevs.ids().len(),
            "pool_open"
        );
        Ok(StoragePool {
            id: self.id,
            vdevs,
            cache,
            throttle,
            tunables,
            unsynced: AtomicU64::new(0),
            sync_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// What a sync wrote and released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Dirty entries written to their devices.
    pub entries: usize,
    pub bytes_written: u64,
    /// Entries still dirty afterwards because they were overwritten mid-sync.
    pub redirtied: usize,
    /// Bytes removed from the pool's dirty counter.
    pub released: u64,
}

/// Combined pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool: u64,
    pub arc: ArcStats,
    pub throttle: ThrottleSnapshot,
    pub queues: Vec<QueueSnapshot>,
    pub unsynced_bytes: u64,
}

/// An open pool.
///
/// Reads go through the cache; writes wait on the throttle, land in the
/// cache as dirty blocks, and reach the devices on [`StoragePool::sync`].
pub struct StoragePool {
    id: PoolId,
    vdevs: Arc<VdevSet>,
    cache: Arc<ArcCache>,
    throttle: Arc<DirtyDataController>,
    tunables: TunableTable,
    /// Bytes accounted with the throttle but not yet covered by a sync.
    unsynced: AtomicU64,
    sync_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl fmt::Debug for StoragePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoragePool")
            .field("id", &self.id)
            .field("vdevs", &self.vdevs)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl StoragePool {
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ArcCache> {
        &self.cache
    }

    #[must_use]
    pub fn vdevs(&self) -> &Arc<VdevSet> {
        &self.vdevs
    }

    #[must_use]
    pub fn throttle(&self) -> &Arc<DirtyDataController> {
        &self.throttle
    }

    #[must_use]
    pub fn tunables(&self) -> &TunableTable {
        &self.tunables
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(ZcError::PoolShutdown { pool: self.id.0 });
        }
        Ok(())
    }

    /// Read a block, blocking until it is available.
    pub fn read(&self, cx: &Cx, key: BlockKey) -> Result<ArcHandle> {
        self.check_open()?;
        self.cache.fetch(cx, key)
    }

    /// Read a block; `done` runs inline on a cache hit.
    pub fn read_async(
        &self,
        cx: &Cx,
        key: BlockKey,
        done: impl FnOnce(Result<ArcHandle>) + Send + 'static,
    ) {
        if let Err(err) = self.check_open() {
            done(Err(err));
            return;
        }
        self.cache.fetch_async(cx, key, done);
    }

    /// Write a block. Waits out the throttle delay, then installs the data
    /// as a dirty cache entry and accounts it as dirty data.
    ///
    /// When the cache is full of dirty data the pool syncs once and retries.
    pub fn write(&self, cx: &Cx, key: BlockKey, data: Vec<u8>) -> Result<()> {
        self.check_open()?;
        if self.vdevs.get(key.vdev)?.is_removed() {
            return Err(ZcError::DeviceGone { vdev: key.vdev.0 });
        }
        self.throttle.wait_for_admission(cx, self.id)?;

        match self.cache.insert(key, data.clone(), true) {
            Ok(()) => {}
            Err(ZcError::OutOfCacheSpace { .. }) => {
                debug!(target: "zc::pool", pool = self.id.0, key = %key, "pool_write_needs_room");
                self.sync(cx)?;
                self.cache.insert(key, data, true)?;
            }
            Err(err) => return Err(err),
        }
        let dirty = self.throttle.account_write(self.id, key.len_bytes())?;
        self.unsynced.fetch_add(key.len_bytes(), Ordering::AcqRel);
        trace!(target: "zc::pool", pool = self.id.0, key = %key, dirty, "pool_write");
        Ok(())
    }

    /// Whether enough dirty data has built up to warrant a sync.
    pub fn needs_sync(&self) -> Result<bool> {
        self.throttle.needs_sync(self.id)
    }

    /// Write every dirty cache entry to its device at async-write priority,
    /// mark the written entries clean, and release the synced bytes from
    /// the throttle.
    ///
    /// On any write failure nothing is released; the failed entries stay
    /// dirty and the next sync covers them.
    pub fn sync(&self, cx: &Cx) -> Result<SyncReport> {
        cx_checkpoint(cx)?;
        let _serialized = self.sync_lock.lock();
        // Everything accounted before this point is already dirty in the cache.
        let accounted = self.unsynced.swap(0, Ordering::AcqRel);
        let restore = |err: ZcError| {
            self.unsynced.fetch_add(accounted, Ordering::AcqRel);
            warn!(target: "zc::pool", pool = self.id.0, error = %err, "pool_sync_failed");
            err
        };

        let dirty = self.cache.dirty_entries().map_err(&restore)?;
        let (tx, rx) = mpsc::channel();
        let mut submitted = 0_usize;
        let mut failure: Option<ZcError> = None;
        for (slot, handle) in dirty.iter().enumerate() {
            let key = handle.key();
            let tx = tx.clone();
            let request = IoRequest::write(
                key.offset.0,
                handle.to_vec(),
                IoPriority::AsyncWrite,
                move |res| {
                    let _ = tx.send((slot, res));
                },
            );
            match self.vdevs.submit(cx, key.vdev, request) {
                Ok(()) => submitted += 1,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        drop(tx);

        let mut written = vec![false; dirty.len()];
        for _ in 0..submitted {
            match rx.recv() {
                Ok((slot, Ok(_))) => written[slot] = true,
                Ok((_, Err(err))) => {
                    failure.get_or_insert(err);
                }
                Err(_) => {
                    failure.get_or_insert(ZcError::Cancelled);
                    break;
                }
            }
        }

        let mut report = SyncReport::default();
        for (handle, ok) in dirty.iter().zip(&written) {
            if !*ok {
                continue;
            }
            report.entries += 1;
            report.bytes_written += handle.key().len_bytes();
            if !self.cache.mark_clean(handle).map_err(&restore)? {
                report.redirtied += 1;
            }
        }
        if let Some(err) = failure {
            return Err(restore(err));
        }

        if accounted > 0 {
            self.throttle.release(self.id, accounted)?;
        }
        report.released = accounted;
        debug!(
            target: "zc::pool",
            pool = self.id.0,
            entries = report.entries,
            bytes = report.bytes_written,
            released = report.released,
            redirtied = report.redirtied,
            "pool_sync"
        );
        Ok(report)
    }

    /// Forward a memory-pressure notification to the cache.
    pub fn memory_pressure(&self, level: MemoryPressure) -> Result<ReclaimOutcome> {
        self.cache.memory_pressure(level)
    }

    /// Detach a device. Its pending and in-flight requests fail with
    /// `DeviceGone`. Returns how many were cancelled.
    pub fn remove_device(&self, vdev: VdevId) -> Result<usize> {
        let cancelled = self.vdevs.remove(vdev)?;
        info!(target: "zc::pool", pool = self.id.0, vdev = vdev.0, cancelled, "pool_device_removed");
        Ok(cancelled)
    }

    /// Stop accepting reads and writes, fail writers sleeping in the
    /// throttle, and flush outstanding dirty data.
    pub fn shutdown(&self, cx: &Cx) -> Result<SyncReport> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(SyncReport::default());
        }
        self.throttle.shutdown(self.id)?;
        let report = self.sync(cx)?;
        info!(
            target: "zc::pool",
            pool = self.id.0,
            flushed = report.bytes_written,
            "pool_shutdown"
        );
        Ok(report)
    }

    /// Snapshot of cache, throttle, and per-device queue statistics.
    pub fn stats(&self) -> Result<PoolStats> {
        Ok(PoolStats {
            pool: self.id.0,
            arc: self.cache.stats(),
            throttle: self.throttle.snapshot(self.id)?,
            queues: self.vdevs.snapshots(),
            unsynced_bytes: self.unsynced.load(Ordering::Acquire),
        })
    }
}

impl Drop for StoragePool {
    fn drop(&mut self) {
        // A shared controller must not keep accounting for a closed pool.
        if let Err(err) = self.throttle.unregister_pool(self.id) {
            debug!(target: "zc::pool", pool = self.id.0, error = %err, "pool_unregister_failed");
        }
    }
}
