//! Per-device I/O scheduler.
//!
//! Each device gets one [`VdevQueue`]. Requests wait in one of five
//! priority classes and are issued to the [`DeviceBackend`] under a
//! device-wide concurrency cap plus per-class floors and ceilings.
//!
//! # Scheduling
//!
//! While the device is below `max_active`, the next class to service is
//! the first class (in precedence order) that is below its `min_active` and
//! has pending work; failing that, the first class below its `max_active`
//! with pending work. Within a class the request with the lowest
//! `(offset, submission sequence)` goes first, so the device sees ascending
//! offsets and equal offsets stay FIFO.
//!
//! The async-write ceiling is not fixed. It scales linearly with the pool's
//! dirty data between `async_write_min_dirty_pct` and
//! `async_write_max_dirty_pct` of the dirty maximum, read through a
//! [`DirtyGauge`].
//!
//! # Aggregation
//!
//! The chosen request absorbs pending neighbors from its own class as long
//! as they do not overlap, the span stays within `aggregation_limit`, and
//! the holes between them stay within `read_gap_limit`. Writes merge only
//! when exactly adjacent, so an aggregated write never touches bytes no
//! member owns. Every member belongs to the class whose active count the
//! operation occupies. Completion splits the device result back to each
//! member.
//!
//! # Cancellation
//!
//! Entry points take the caller's [`Cx`]. It is checkpointed before a
//! request is queued, and the blocking adapters checkpoint it again once
//! the request completes, so a cancelled caller sees `Cancelled` even when
//! the device finished the work.
//!
//! # Concurrency
//!
//! All bookkeeping lives under one mutex. Backend submission and user
//! callbacks always run with the lock released. Only one thread at a time
//! issues work (the "pump"); a thread that finds the pump busy flags a
//! rerun and leaves, and the pumping thread keeps draining until nothing is
//! issuable.
//!
//! # Logging
//!
//! - **TRACE** `zc::vdev::queue`: `io_submit`, `io_issue`, `io_complete`: per-request path
//! - **TRACE** `zc::vdev::queue`: `late_completion_ignored`: completion after removal
//! - **DEBUG** `zc::vdev::queue`: `io_aggregate`: neighbors merged into one operation
//! - **INFO**  `zc::vdev::queue`: `vdev_queue_init`, `vdev_removed`: lifecycle

use crate::aggregate::{Extent, can_append, gather_writes, split_read};
use crate::config::VdevQueueConfig;
use crate::cx_checkpoint;
use crate::engine::{DeviceBackend, DeviceOp, DeviceResult, DeviceStats};
use asupersync::Cx;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::mpsc;
use tracing::{debug, info, trace};
use zc_error::{Result, ZcError};
use zc_types::{ConfigCell, DirtyGauge, IoKind, IoPriority, VdevId};

/// Successful completion of a queued request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoOutcome {
    pub transferred: u64,
    /// Data read. Empty for writes.
    pub data: Vec<u8>,
}

/// Completion callback for a queued request. Invoked exactly once.
pub type IoCallback = Box<dyn FnOnce(Result<IoOutcome>) + Send + 'static>;

/// A request handed to [`VdevQueue::submit`].
pub struct IoRequest {
    offset: u64,
    len: u32,
    priority: IoPriority,
    payload: Option<Vec<u8>>,
    done: IoCallback,
}

impl IoRequest {
    /// Read `len` bytes at `offset`.
    pub fn read(
        offset: u64,
        len: u32,
        priority: IoPriority,
        done: impl FnOnce(Result<IoOutcome>) + Send + 'static,
    ) -> Self {
        Self {
            offset,
            len,
            priority,
            payload: None,
            done: Box::new(done),
        }
    }

    /// Write `data` at `offset`.
    pub fn write(
        offset: u64,
        data: Vec<u8>,
        priority: IoPriority,
        done: impl FnOnce(Result<IoOutcome>) + Send + 'static,
    ) -> Self {
        Self {
            offset,
            len: u32::try_from(data.len()).unwrap_or(u32::MAX),
            priority,
            payload: Some(data),
            done: Box::new(done),
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn priority(&self) -> IoPriority {
        self.priority
    }

    fn validate(&self) -> Result<()> {
        if self.len == 0 {
            return Err(ZcError::InvalidArgument("zero-length request".into()));
        }
        if self.offset.checked_add(u64::from(self.len)).is_none() {
            return Err(ZcError::InvalidArgument(format!(
                "request at {} of {} bytes wraps the address space",
                self.offset, self.len
            )));
        }
        match (self.priority.kind(), &self.payload) {
            (IoKind::Read, None) => Ok(()),
            (IoKind::Write, Some(data)) if data.len() == self.len as usize => Ok(()),
            (IoKind::Write, Some(data)) => Err(ZcError::InvalidArgument(format!(
                "write payload of {} bytes does not fit a single request",
                data.len()
            ))),
            (kind, _) => Err(ZcError::InvalidArgument(format!(
                "priority {} carries {kind:?} but request direction differs",
                self.priority
            ))),
        }
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("priority", &self.priority)
            .field("has_payload", &self.payload.is_some())
            .finish_non_exhaustive()
    }
}

/// Cumulative queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    /// Device operations issued (an aggregate counts once).
    pub issued: u64,
    /// Requests that rode along in another request's operation.
    pub aggregated: u64,
    pub completed: u64,
    pub errors: u64,
    pub cancelled: u64,
    pub late_completions: u64,
    pub peak_active: [u32; IoPriority::COUNT],
    pub peak_total_active: u32,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub vdev: u32,
    pub backend: &'static str,
    pub config_version: u64,
    pub removed: bool,
    pub total_active: u32,
    pub active: [u32; IoPriority::COUNT],
    pub pending: [usize; IoPriority::COUNT],
    pub async_write_max_active: u32,
    pub stats: QueueStats,
}

/// Pending requests are ordered by `(offset, sequence)`.
type PendingKey = (u64, u64);

struct Pending {
    offset: u64,
    len: u32,
    payload: Option<Vec<u8>>,
    done: IoCallback,
}

struct Member {
    offset: u64,
    len: u32,
    done: IoCallback,
}

struct InFlight {
    priority: IoPriority,
    kind: IoKind,
    base: u64,
    members: Vec<Member>,
}

enum Work {
    Issue { io_id: u64, op: DeviceOp },
    Fail { callbacks: Vec<IoCallback>, error: ZcError },
}

struct QueueState {
    pending: [BTreeMap<PendingKey, Pending>; IoPriority::COUNT],
    active: [u32; IoPriority::COUNT],
    total_active: u32,
    in_flight: HashMap<u64, InFlight>,
    next_seq: u64,
    next_io: u64,
    pumping: bool,
    rerun: bool,
    removed: bool,
    stats: QueueStats,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: std::array::from_fn(|_| BTreeMap::new()),
            active: [0; IoPriority::COUNT],
            total_active: 0,
            in_flight: HashMap::new(),
            next_seq: 0,
            next_io: 0,
            pumping: false,
            rerun: false,
            removed: false,
            stats: QueueStats::default(),
        }
    }


    fn select_class(&self, cfg: &VdevQueueConfig, async_write_max: u32) -> Option<IoPriority> {
        if self.total_active >= cfg.max_active {
            return None;
        }
        let has_work = |p: IoPriority| !self.pending[p.index()].is_empty();
        let ceiling = |p: IoPriority| {
            if p == IoPriority::AsyncWrite {
                async_write_max
            } else {
                cfg.limits(p).max_active
            }
        };
        IoPriority::ALL
            .into_iter()
            .find(|&p| has_work(p) && self.active[p.index()] < cfg.limits(p).min_active)
            .or_else(|| {
                IoPriority::ALL
                    .into_iter()
                    .find(|&p| has_work(p) && self.active[p.index()] < ceiling(p))
            })
    }

    /// Remove the head of `priority` plus every neighbor in the same class
    /// that can join it. Returned members are in ascending offset order.
    fn take_aggregate(
        &mut self,
        priority: IoPriority,
        cfg: &VdevQueueConfig,
    ) -> Option<Vec<Pending>> {
        let class = &mut self.pending[priority.index()];
        let (leader_key, leader) = class.pop_first()?;
        let limit = u64::from(cfg.aggregation_limit);
        let gap = u64::from(cfg.gap_limit(priority.kind()));
        let start = leader.offset;
        let mut end = leader.offset + u64::from(leader.len);
        let mut after = Vec::new();

        // The leader has the lowest key in its class, so only later
        // neighbors can join.
        if limit > u64::from(leader.len) {
            for (&key, next) in class.range((Bound::Excluded(leader_key), Bound::Unbounded)) {
                let ext = Extent::new(next.offset, u64::from(next.len));
                if !can_append(start, end, ext, gap, limit) {
                    break;
                }
                end = ext.end();
                after.push(key);
            }
        }

        let mut members = Vec::with_capacity(1 + after.len());
        members.push(leader);
        for key in after {
            members.extend(class.remove(&key));
        }
        Some(members)
    }
}

/// Scheduler for one device.
pub struct VdevQueue {
    vdev: VdevId,
    backend: Arc<dyn DeviceBackend>,
    config: Arc<ConfigCell<VdevQueueConfig>>,
    gauge: Option<Arc<dyn DirtyGauge>>,
    state: Mutex<QueueState>,
}

impl fmt::Debug for VdevQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VdevQueue")
            .field("vdev", &self.vdev)
            .field("backend", &self.backend.name())
            .field("config_version", &self.config.version())
            .finish_non_exhaustive()
    }
}

impl VdevQueue {
    /// Create a queue in front of `backend`.
    ///
    /// `gauge` drives async-write scaling; without one the configured
    /// async-write ceiling applies.
    pub fn new(
        vdev: VdevId,
        backend: Arc<dyn DeviceBackend>,
        config: Arc<ConfigCell<VdevQueueConfig>>,
        gauge: Option<Arc<dyn DirtyGauge>>,
    ) -> Arc<Self> {
        info!(
            target: "zc::vdev::queue",
            vdev = vdev.0,
            backend = backend.name(),
            max_active = config.load().value.max_active,
            dirty_scaling = gauge.is_some(),
            "vdev_queue_init"
        );
        Arc::new(Self {
            vdev,
            backend,
            config,
            gauge,
            state: Mutex::new(QueueState::new()),
        })
    }

    #[must_use]
    pub fn vdev(&self) -> VdevId {
        self.vdev
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigCell<VdevQueueConfig>> {
        &self.config
    }

    #[must_use]
    pub fn device_stats(&self) -> DeviceStats {
        self.backend.stats()
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Queue a request. The callback fires once the request completes,
    /// fails, or is cancelled by device removal.
    ///
    /// On `Err` the request was not queued and its callback is dropped
    /// without being invoked. A cancelled `cx` fails with `Cancelled`.
    pub fn submit(self: &Arc<Self>, cx: &Cx, request: IoRequest) -> Result<()> {
        cx_checkpoint(cx)?;
        request.validate()?;
        let IoRequest {
            offset,
            len,
            priority,
            payload,
            done,
        } = request;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.removed {
                return Err(ZcError::DeviceGone { vdev: self.vdev.0 });
            }
            let key = (offset, st.next_seq);
            st.next_seq += 1;
            st.pending[priority.index()].insert(
                key,
                Pending {
                    offset,
                    len,
                    payload,
                    done,
                },
            );
            st.stats.submitted += 1;
        }
        trace!(
            target: "zc::vdev::queue",
            vdev = self.vdev.0,
            offset,
            len,
            priority = priority.as_str(),
            "io_submit"
        );
        self.pump();
        Ok(())
    }

    /// Submit a read and block until it completes.
    pub fn read_blocking(
        self: &Arc<Self>,
        cx: &Cx,
        offset: u64,
        len: u32,
        priority: IoPriority,
    ) -> Result<IoOutcome> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(
            cx,
            IoRequest::read(offset, len, priority, move |res| {
                let _ = tx.send(res);
            }),
        )?;
        let outcome = rx.recv().map_err(|_| ZcError::Cancelled)??;
        cx_checkpoint(cx)?;
        Ok(outcome)
    }

    /// Submit a write and block until it completes.
    pub fn write_blocking(
        self: &Arc<Self>,
        cx: &Cx,
        offset: u64,
        data: Vec<u8>,
        priority: IoPriority,
    ) -> Result<IoOutcome> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(
            cx,
            IoRequest::write(offset, data, priority, move |res| {
                let _ = tx.send(res);
            }),
        )?;
        let outcome = rx.recv().map_err(|_| ZcError::Cancelled)??;
        cx_checkpoint(cx)?;
        Ok(outcome)
    }

    /// Re-run scheduling, e.g. after a configuration change raised limits.
    pub fn reschedule(self: &Arc<Self>) {
        self.pump();
    }

    /// Detach the device: every pending and in-flight request completes
    /// with `DeviceGone`, later submissions are refused, and completions
    /// still arriving from the backend are dropped.
    ///
    /// Returns the number of requests cancelled.
    pub fn remove(&self) -> usize {
        let callbacks = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.removed {
                return 0;
            }
            st.removed = true;
            let mut callbacks: Vec<IoCallback> = Vec::new();
            for class in &mut st.pending {
                callbacks.extend(std::mem::take(class).into_values().map(|p| p.done));
            }
            for (_, io) in st.in_flight.drain() {
                callbacks.extend(io.members.into_iter().map(|m| m.done));
            }
            st.active = [0; IoPriority::COUNT];
            st.total_active = 0;
            st.stats.cancelled += callbacks.len() as u64;
            callbacks
        };
        let cancelled = callbacks.len();
        info!(
            target: "zc::vdev::queue",
            vdev = self.vdev.0,
            cancelled,
            "vdev_removed"
        );
        for done in callbacks {
            done(Err(ZcError::DeviceGone { vdev: self.vdev.0 }));
        }
        cancelled
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let cfg = self.config.load();
        let async_write_max_active = self.async_write_max_active(&cfg.value);
        let st = self.state.lock();
        QueueSnapshot {
            vdev: self.vdev.0,
            backend: self.backend.name(),
            config_version: cfg.version,
            removed: st.removed,
            total_active: st.total_active,
            active: st.active,
            pending: std::array::from_fn(|i| st.pending[i].len()),
            async_write_max_active,
            stats: st.stats,
        }
    }

    fn async_write_max_active(&self, cfg: &VdevQueueConfig) -> u32 {
        match &self.gauge {
            Some(gauge) => scaled_async_write_max(cfg, gauge.dirty_bytes(), gauge.dirty_max()),
            None => cfg.limits(IoPriority::AsyncWrite).max_active,
        }
    }

    fn pump(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.pumping {
                st.rerun = true;
                return;
            }
            st.pumping = true;
        }
        loop {
            let cfg = self.config.load();
            let async_write_max = self.async_write_max_active(&cfg.value);
            let work = {
                let mut st = self.state.lock();
                let rerun = std::mem::take(&mut st.rerun);
                let work = self.collect_work(&mut st, &cfg.value, async_write_max);
                if work.is_empty() && !rerun {
                    st.pumping = false;
                    return;
                }
                work
            };
            for item in work {
                self.dispatch(item);
            }
        }
    }

    fn collect_work(
        &self,
        st: &mut QueueState,
        cfg: &VdevQueueConfig,
        async_write_max: u32,
    ) -> Vec<Work> {
        let mut work = Vec::new();
        if st.removed {
            return work;
        }
        while let Some(priority) = st.select_class(cfg, async_write_max) {
            let Some(members) = st.take_aggregate(priority, cfg) else {
                break;
            };
            work.push(self.prepare(st, priority, members));
        }
        work
    }

    fn prepare(&self, st: &mut QueueState, priority: IoPriority, members: Vec<Pending>) -> Work {
        let kind = priority.kind();
        let base = members.first().map_or(0, |m| m.offset);
        let end = members
            .iter()
            .map(|m| m.offset + u64::from(m.len))
            .max()
            .unwrap_or(base);
        let len = end - base;

        let op = match kind {
            IoKind::Read => Ok(DeviceOp::Read { offset: base, len }),
            IoKind::Write => {
                let parts: Vec<(Extent, &[u8])> = members
                    .iter()
                    .map(|m| {
                        (
                            Extent::new(m.offset, u64::from(m.len)),
                            m.payload.as_deref().unwrap_or(&[]),
                        )
                    })
                    .collect();
                gather_writes(base, len, &parts).map(|data| DeviceOp::Write { offset: base, data })
            }
        };
        let op = match op {
            Ok(op) => op,
            Err(error) => {
                return Work::Fail {
                    callbacks: members.into_iter().map(|m| m.done).collect(),
                    error,
                };
            }
        };

        if members.len() > 1 {
            debug!(
                target: "zc::vdev::queue",
                vdev = self.vdev.0,
                priority = priority.as_str(),
                members = members.len(),
                offset = base,
                len,
                "io_aggregate"
            );
            st.stats.aggregated += members.len() as u64 - 1;
        }

        let io_id = st.next_io;
        st.next_io += 1;
        let slot = priority.index();
        st.active[slot] += 1;
        st.total_active += 1;
        st.stats.issued += 1;
        st.stats.peak_active[slot] = st.stats.peak_active[slot].max(st.active[slot]);
        st.stats.peak_total_active = st.stats.peak_total_active.max(st.total_active);
        st.in_flight.insert(
            io_id,
            InFlight {
                priority,
                kind,
                base,
                members: members
                    .into_iter()
                    .map(|m| Member {
                        offset: m.offset,
                        len: m.len,
                        done: m.done,
                    })
                    .collect(),
            },
        );
        Work::Issue { io_id, op }
    }

    fn dispatch(self: &Arc<Self>, work: Work) {
        match work {
            Work::Issue { io_id, op } => {
                trace!(
                    target: "zc::vdev::queue",
                    vdev = self.vdev.0,
                    io_id,
                    offset = op.offset(),
                    len = op.len(),
                    "io_issue"
                );
                let queue = Arc::clone(self);
                self.backend
                    .issue(op, Box::new(move |res| queue.complete(io_id, res)));
            }
            Work::Fail { callbacks, error } => {
                for done in callbacks {
                    done(Err(error.clone()));
                }
            }
        }
    }

    fn complete(self: &Arc<Self>, io_id: u64, result: DeviceResult) {
        let io = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(io) = st.in_flight.remove(&io_id) else {
                st.stats.late_completions += 1;
                trace!(
                    target: "zc::vdev::queue",
                    vdev = self.vdev.0,
                    io_id,
                    "late_completion_ignored"
                );
                return;
            };
            let slot = io.priority.index();
            st.active[slot] = st.active[slot].saturating_sub(1);
            st.total_active = st.total_active.saturating_sub(1);
            st.stats.completed += io.members.len() as u64;
            if result.is_err() {
                st.stats.errors += 1;
            }
            io
        };
        trace!(
            target: "zc::vdev::queue",
            vdev = self.vdev.0,
            io_id,
            ok = result.is_ok(),
            "io_complete"
        );
        self.deliver(io, result);
        self.pump();
    }

    fn deliver(&self, io: InFlight, result: DeviceResult) {
        let output = match result {
            Ok(output) => output,
            Err(error) => {
                for member in io.members {
                    (member.done)(Err(error.clone()));
                }
                return;
            }
        };
        match io.kind {
            IoKind::Write => {
                for member in io.members {
                    (member.done)(Ok(IoOutcome {
                        transferred: u64::from(member.len),
                        data: Vec::new(),
                    }));
                }
            }
            IoKind::Read => {
                let extents: Vec<Extent> = io
                    .members
                    .iter()
                    .map(|m| Extent::new(m.offset, u64::from(m.len)))
                    .collect();
                match split_read(io.base, &output.data, &extents) {
                    Ok(parts) => {
                        for (member, data) in io.members.into_iter().zip(parts) {
                            (member.done)(Ok(IoOutcome {
                                transferred: u64::from(member.len),
                                data,
                            }));
                        }
                    }
                    Err(_) => {
                        let error = ZcError::DeviceIo {
                            vdev: self.vdev.0,
                            offset: io.base,
                            errno: None,
                            transient: false,
                            detail: format!("short read: {} bytes returned", output.data.len()),
                        };
                        for member in io.members {
                            (member.done)(Err(error.clone()));
                        }
                    }
                }
            }
        }
    }
}

/// Async-write ceiling for the given dirty level.
///
/// Below the low watermark the class floor applies, above the high
/// watermark the ceiling, and in between the value is interpolated.
#[must_use]
pub fn scaled_async_write_max(cfg: &VdevQueueConfig, dirty: u64, dirty_max: u64) -> u32 {
    let limits = cfg.limits(IoPriority::AsyncWrite);
    if dirty_max == 0 {
        return limits.max_active;
    }
    let min_bytes = u128::from(dirty_max) * u128::from(cfg.async_write_min_dirty_pct) / 100;
    let max_bytes = u128::from(dirty_max) * u128::from(cfg.async_write_max_dirty_pct) / 100;
    let dirty = u128::from(dirty);
    if dirty < min_bytes {
        return limits.min_active;
    }
    if dirty > max_bytes || max_bytes == min_bytes {
        return limits.max_active;
    }
    let span = u128::from(limits.max_active.saturating_sub(limits.min_active));
    let extra = (dirty - min_bytes) * span / (max_bytes - min_bytes);
    limits
        .min_active
        .saturating_add(u32::try_from(extra).unwrap_or(u32::MAX))
        .min(limits.max_active)
}
