//! Device submission interface and the stock backends.
//!
//! Defines the [`DeviceBackend`] trait the scheduler issues into:
//!
//! - **[`MemDevice`]**: in-memory device that completes inline. Supports
//!   fault injection for error-path tests.
//! - **[`FileDevice`]**: positional `pread`/`pwrite` on a file or block
//!   node. Completes inline on the issuing thread.
//! - **[`WorkerDevice`]**: wraps another backend and runs its operations on
//!   dedicated worker threads, so completions arrive asynchronously from a
//!   different context than the submitter.
//!
//! # Design
//!
//! One operation, one completion. `issue` never blocks waiting for the
//! device on asynchronous backends; the callback receives either the bytes
//! transferred (plus data for reads) or the device error. Callbacks run in
//! completion context and must only hand follow-up work off.
//!
//! # Logging
//!
//! - **TRACE** `zc::vdev::engine`: `device_issue`: operation handed to a backend
//! - **WARN**  `zc::vdev::engine`: `device_io_error`: backend reported a failure
//! - **INFO**  `zc::vdev::engine`: `worker_device_shutdown`: worker threads joined

use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, trace, warn};
use zc_error::{Result, ZcError};
use zc_types::{IoKind, VdevId};

/// A single device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    /// Read `len` bytes starting at `offset`.
    Read { offset: u64, len: u64 },
    /// Write `data` at `offset`.
    Write { offset: u64, data: Vec<u8> },
}

impl DeviceOp {
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Read { offset, .. } | Self::Write { offset, .. } => *offset,
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Read { len, .. } => *len,
            Self::Write { data, .. } => data.len() as u64,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn kind(&self) -> IoKind {
        match self {
            Self::Read { .. } => IoKind::Read,
            Self::Write { .. } => IoKind::Write,
        }
    }

    fn range(&self) -> Option<Range<u64>> {
        let start = self.offset();
        start.checked_add(self.len()).map(|end| start..end)
    }
}

/// Successful completion of a device operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceOutput {
    /// Bytes moved to or from the device.
    pub transferred: u64,
    /// Data read. Empty for writes.
    pub data: Vec<u8>,
}

/// Completion payload delivered to a [`DeviceCallback`].
pub type DeviceResult = Result<DeviceOutput>;

/// Completion callback. Runs in completion context: no blocking work.
pub type DeviceCallback = Box<dyn FnOnce(DeviceResult) + Send + 'static>;

/// Backend counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

/// Abstract "issue I/O" interface consumed by the scheduler.
pub trait DeviceBackend: Send + Sync {
    /// Start `op`; invoke `done` exactly once when it finishes or fails.
    fn issue(&self, op: DeviceOp, done: DeviceCallback);

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Current counters.
    fn stats(&self) -> DeviceStats;
}

fn record_success(stats: &Mutex<DeviceStats>, op: &DeviceOp) {
    let mut s = stats.lock();
    match op.kind() {
        IoKind::Read => {
            s.reads += 1;
            s.bytes_read += op.len();
        }
        IoKind::Write => {
            s.writes += 1;
            s.bytes_written += op.len();
        }
    }
}

fn record_error(stats: &Mutex<DeviceStats>, vdev: VdevId, op: &DeviceOp, err: &ZcError) {
    stats.lock().errors += 1;
    warn!(
        target: "zc::vdev::engine",
        vdev = vdev.0,
        offset = op.offset(),
        len = op.len(),
        error = %err,
        "device_io_error"
    );
}

// ── In-memory device ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Fault {
    range: Range<u64>,
    transient: bool,
}

/// In-memory device for tests and benchmarks.
///
/// Completes every operation inline before `issue` returns. Operations that
/// overlap an injected fault range fail with a `DeviceIo` error.
pub struct MemDevice {
    vdev: VdevId,
    data: Mutex<Vec<u8>>,
    faults: Mutex<Vec<Fault>>,
    stats: Mutex<DeviceStats>,
}

impl MemDevice {
    /// Create a zero-filled device of `size` bytes.
    #[must_use]
    pub fn new(vdev: VdevId, size: usize) -> Self {
        Self {
            vdev,
            data: Mutex::new(vec![0_u8; size]),
            faults: Mutex::new(Vec::new()),
            stats: Mutex::new(DeviceStats::default()),
        }
    }

    /// Fail every operation touching `range`.
    pub fn inject_fault(&self, range: Range<u64>, transient: bool) {
        self.faults.lock().push(Fault { range, transient });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Copy bytes straight out of the backing store, bypassing stats.
    #[must_use]
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Vec::new();
        };
        let end = start.saturating_add(len).min(data.len());
        data.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Write bytes straight into the backing store, bypassing stats.
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return;
        };
        if let Some(slot) = data.get_mut(start..start.saturating_add(bytes.len())) {
            slot.copy_from_slice(bytes);
        }
    }

    fn fault_for(&self, op: &DeviceOp) -> Option<ZcError> {
        let range = op.range()?;
        self.faults
            .lock()
            .iter()
            .find(|f| f.range.start < range.end && range.start < f.range.end)
            .map(|f| ZcError::DeviceIo {
                vdev: self.vdev.0,
                offset: op.offset(),
                errno: Some(libc::EIO),
                transient: f.transient,
                detail: "injected fault".to_owned(),
            })
    }

    fn execute(&self, op: &DeviceOp) -> DeviceResult {
        if let Some(err) = self.fault_for(op) {
            return Err(err);
        }
        let out_of_range = || ZcError::DeviceIo {
            vdev: self.vdev.0,
            offset: op.offset(),
            errno: None,
            transient: false,
            detail: format!("range past end of device: len={}", op.len()),
        };
        let range = op.range().ok_or_else(out_of_range)?;
        let start = usize::try_from(range.start).map_err(|_| out_of_range())?;
        let end = usize::try_from(range.end).map_err(|_| out_of_range())?;

        let mut data = self.data.lock();
        if end > data.len() {
            return Err(out_of_range());
        }
        match op {
            DeviceOp::Read { len, .. } => Ok(DeviceOutput {
                transferred: *len,
                data: data[start..end].to_vec(),
            }),
            DeviceOp::Write { data: bytes, .. } => {
                data[start..end].copy_from_slice(bytes);
                Ok(DeviceOutput {
                    transferred: bytes.len() as u64,
                    data: Vec::new(),
                })
            }
        }
    }
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice")
            .field("vdev", &self.vdev)
            .field("size", &self.data.lock().len())
            .finish_non_exhaustive()
    }
}

impl DeviceBackend for MemDevice {
    fn issue(&self, op: DeviceOp, done: DeviceCallback) {
        trace!(
            target: "zc::vdev::engine",
            vdev = self.vdev.0,
            kind = ?op.kind(),
            offset = op.offset(),
            len = op.len(),
            "device_issue"
        );
        let result = self.execute(&op);
        match &result {
            Ok(_) => record_success(&self.stats, &op),
            Err(err) => record_error(&self.stats, self.vdev, &op, err),
        }
        done(result);
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> DeviceStats {
        *self.stats.lock()
    }
}

// ── File device ────────────────────────────────────────────────────────────

/// File-backed device using positional reads and writes.
///
/// `FileExt` is thread-safe and needs no shared seek position, so a single
/// handle serves concurrent operations.
pub struct FileDevice {
    vdev: VdevId,
    file: Arc<File>,
    len: u64,
    stats: Mutex<DeviceStats>,
}

impl FileDevice {
    /// Open a file for I/O. Opens read-write if possible, read-only otherwise.
    pub fn open(vdev: VdevId, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|_| OpenOptions::new().read(true).open(path))
            .map_err(|e| ZcError::device_io(vdev.0, 0, &e))?;
        let len = file
            .metadata()
            .map_err(|e| ZcError::device_io(vdev.0, 0, &e))?
            .len();
        Ok(Self {
            vdev,
            file: Arc::new(file),
            len,
            stats: Mutex::new(DeviceStats::default()),
        })
    }

    /// Device length in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    fn execute(&self, op: DeviceOp) -> DeviceResult {
        let end = op.range().map(|r| r.end);
        if end.is_none_or(|end| end > self.len) {
            return Err(ZcError::DeviceIo {
                vdev: self.vdev.0,
                offset: op.offset(),
                errno: None,
                transient: false,
                detail: format!(
                    "range past end of device: len={} device_len={}",
                    op.len(),
                    self.len
                ),
            });
        }
        match op {
            DeviceOp::Read { offset, len } => {
                let size = usize::try_from(len).map_err(|_| {
                    ZcError::InvalidArgument(format!("read length {len} does not fit usize"))
                })?;
                let mut buf = vec![0_u8; size];
                self.file
                    .read_exact_at(&mut buf, offset)
                    .map_err(|e| ZcError::device_io(self.vdev.0, offset, &e))?;
                Ok(DeviceOutput {
                    transferred: len,
                    data: buf,
                })
            }
            DeviceOp::Write { offset, data } => {
                self.file
                    .write_all_at(&data, offset)
                    .map_err(|e| ZcError::device_io(self.vdev.0, offset, &e))?;
                Ok(DeviceOutput {
                    transferred: data.len() as u64,
                    data: Vec::new(),
                })
            }
        }
    }
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice")
            .field("vdev", &self.vdev)
            .field("len", &self.len)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl DeviceBackend for FileDevice {
    fn issue(&self, op: DeviceOp, done: DeviceCallback) {
        trace!(
            target: "zc::vdev::engine",
            vdev = self.vdev.0,
            kind = ?op.kind(),
            offset = op.offset(),
            len = op.len(),
            "device_issue"
        );
        let issued = op.clone();
        let result = self.execute(op);
        match &result {
            Ok(_) => record_success(&self.stats, &issued),
            Err(err) => record_error(&self.stats, self.vdev, &issued, err),
        }
        done(result);
    }

    fn name(&self) -> &'static str {
        "pread/pwrite"
    }

    fn stats(&self) -> DeviceStats {
        *self.stats.lock()
    }
}

// ── Worker-thread device ───────────────────────────────────────────────────

type Job = (DeviceOp, DeviceCallback);

/// Runs an inner backend on dedicated worker threads.
///
/// `issue` only enqueues; completions fire on a worker thread. An optional
/// per-operation latency models slow media.
pub struct WorkerDevice {
    vdev: VdevId,
    inner: Arc<dyn DeviceBackend>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerDevice {
    /// Spawn `threads` workers (at least one) in front of `inner`.
    pub fn new(
        vdev: VdevId,
        inner: Arc<dyn DeviceBackend>,
        threads: usize,
        latency: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let inner = Arc::clone(&inner);
                std::thread::spawn(move || {
                    loop {
                        let job = rx.lock().recv();
                        let Ok((op, done)) = job else {
                            break;
                        };
                        if !latency.is_zero() {
                            std::thread::sleep(latency);
                        }
                        inner.issue(op, done);
                    }
                })
            })
            .collect();
        Self {
            vdev,
            inner,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Stop accepting work and join the workers after they drain the queue.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        let me = std::thread::current().id();
        for handle in workers {
            // The last owner may be dropped from a completion on a worker.
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        info!(
            target: "zc::vdev::engine",
            vdev = self.vdev.0,
            workers = count,
            "worker_device_shutdown"
        );
    }
}

impl Drop for WorkerDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDevice")
            .field("vdev", &self.vdev)
            .field("inner", &self.inner.name())
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl DeviceBackend for WorkerDevice {
    fn issue(&self, op: DeviceOp, done: DeviceCallback) {
        let rejected = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(tx) => tx.send((op, done)).err().map(|mpsc::SendError(job)| job),
                None => Some((op, done)),
            }
        };
        if let Some((_, done)) = rejected {
            done(Err(ZcError::DeviceGone { vdev: self.vdev.0 }));
        }
    }

    fn name(&self) -> &'static str {
        "worker"
    }

    fn stats(&self) -> DeviceStats {
        self.inner.stats()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
