#![forbid(unsafe_code)]

use asupersync::Cx;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use zc_error::ZcError;
use zc_types::{ConfigCell, DirtyGauge, IoPriority, VdevId};
use zc_vdev::{
    ClassLimits, DeviceBackend, DeviceCallback, DeviceOp, DeviceOutput, DeviceStats, FileDevice,
    IoOutcome, IoRequest, MemDevice, VdevQueue, VdevQueueConfig, WorkerDevice,
};

/// Deterministic byte at absolute device position `pos`.
fn pattern(pos: u64) -> u8 {
    u8::try_from(pos % 251).expect("< 256")
}

/// Backend that parks every operation until the test completes it.
#[derive(Default)]
struct ManualDevice {
    queued: Mutex<VecDeque<(DeviceOp, DeviceCallback)>>,
    issued: Mutex<Vec<DeviceOp>>,
    peak_outstanding: AtomicUsize,
}

impl ManualDevice {
    fn outstanding(&self) -> usize {
        self.queued.lock().len()
    }

    fn issued(&self) -> Vec<DeviceOp> {
        self.issued.lock().clone()
    }

    fn issued_offsets(&self) -> Vec<u64> {
        self.issued.lock().iter().map(DeviceOp::offset).collect()
    }

    /// Complete the oldest outstanding operation successfully.
    fn complete_next(&self) -> bool {
        let Some((op, done)) = self.queued.lock().pop_front() else {
            return false;
        };
        let output = match op {
            DeviceOp::Read { offset, len } => DeviceOutput {
                transferred: len,
                data: (offset..offset + len).map(pattern).collect(),
            },
            DeviceOp::Write { data, .. } => DeviceOutput {
                transferred: data.len() as u64,
                data: Vec::new(),
            },
        };
        done(Ok(output));
        true
    }

    fn fail_next(&self, error: ZcError) -> bool {
        let Some((_, done)) = self.queued.lock().pop_front() else {
            return false;
        };
        done(Err(error));
        true
    }

    fn drain(&self) {
        while self.complete_next() {}
    }
}

impl DeviceBackend for ManualDevice {
    fn issue(&self, op: DeviceOp, done: DeviceCallback) {
        self.issued.lock().push(op.clone());
        let mut queued = self.queued.lock();
        queued.push_back((op, done));
        self.peak_outstanding
            .fetch_max(queued.len(), Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "manual"
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats::default()
    }
}

struct FixedGauge {
    dirty: AtomicU64,
    max: u64,
}

impl DirtyGauge for FixedGauge {
    fn dirty_bytes(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }

    fn dirty_max(&self) -> u64 {
        self.max
    }
}

type Completions = Arc<Mutex<Vec<(u64, Result<IoOutcome, ZcError>)>>>;

fn manual_queue(
    cfg: VdevQueueConfig,
    gauge: Option<Arc<dyn DirtyGauge>>,
) -> (Arc<VdevQueue>, Arc<ManualDevice>) {
    let dev = Arc::new(ManualDevice::default());
    let backend: Arc<dyn DeviceBackend> = dev.clone();
    let queue = VdevQueue::new(
        VdevId(0),
        backend,
        Arc::new(ConfigCell::new("vdev", cfg)),
        gauge,
    );
    (queue, dev)
}

fn no_aggregation() -> VdevQueueConfig {
    VdevQueueConfig {
        aggregation_limit: 0,
        ..VdevQueueConfig::default()
    }
}

fn submit_read(queue: &Arc<VdevQueue>, done: &Completions, offset: u64, len: u32, prio: IoPriority) {
    let done = Arc::clone(done);
    queue
        .submit(
            &Cx::for_testing(),
            IoRequest::read(offset, len, prio, move |res| {
                done.lock().push((offset, res));
            }),
        )
        .expect("submit read");
}

fn submit_write(queue: &Arc<VdevQueue>, done: &Completions, offset: u64, data: Vec<u8>, prio: IoPriority) {
    let done = Arc::clone(done);
    queue
        .submit(
            &Cx::for_testing(),
            IoRequest::write(offset, data, prio, move |res| {
                done.lock().push((offset, res));
            }),
        )
        .expect("submit write");
}

#[test]
fn sync_reads_capped_and_issued_in_offset_order() {
    let mut cfg = no_aggregation();
    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(2, 2);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    for offset in [40_960, 32_768, 24_576, 0, 16_384] {
        submit_read(&queue, &done, offset, 512, IoPriority::SyncRead);
        assert!(dev.outstanding() <= 2);
    }
    assert_eq!(dev.issued_offsets(), vec![40_960, 32_768]);
    assert_eq!(queue.snapshot().pending[IoPriority::SyncRead.index()], 3);

    dev.drain();

    assert_eq!(
        dev.issued_offsets(),
        vec![40_960, 32_768, 0, 16_384, 24_576]
    );
    assert_eq!(dev.peak_outstanding.load(Ordering::SeqCst), 2);
    let done = done.lock();
    assert_eq!(done.len(), 5);
    for (offset, res) in done.iter() {
        let out = res.as_ref().expect("read ok");
        assert_eq!(out.data.len(), 512);
        assert_eq!(out.data[0], pattern(*offset));
    }
    let stats = queue.stats();
    assert_eq!(stats.peak_active[IoPriority::SyncRead.index()], 2);
    assert_eq!(stats.completed, 5);
}

#[test]
fn equal_offsets_stay_fifo() {
    let mut cfg = no_aggregation();
    *cfg.limits_mut(IoPriority::SyncWrite) = ClassLimits::new(1, 1);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_write(&queue, &done, 1 << 20, vec![0; 512], IoPriority::SyncWrite);
    for tag in 1..=3_u8 {
        submit_write(&queue, &done, 4096, vec![tag; 512], IoPriority::SyncWrite);
    }
    dev.drain();

    let tags: Vec<u8> = dev
        .issued()
        .iter()
        .skip(1)
        .map(|op| match op {
            DeviceOp::Write { data, .. } => data[0],
            DeviceOp::Read { .. } => 0,
        })
        .collect();
    assert_eq!(tags, vec![1, 2, 3]);
}

#[test]
fn class_below_min_active_is_served_first() {
    let mut cfg = no_aggregation();
    cfg.max_active = 4;
    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(3, 3);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    for i in 0..8 {
        submit_read(&queue, &done, i * 65_536, 512, IoPriority::SyncRead);
    }
    assert_eq!(dev.outstanding(), 3);
    submit_read(&queue, &done, 1 << 30, 512, IoPriority::Scrub);
    assert_eq!(dev.outstanding(), 4);
    assert_eq!(dev.issued_offsets()[3], 1 << 30);

    // Device cap reached: a second scrub waits even though scrub max is 2.
    submit_read(&queue, &done, (1 << 30) + 65_536, 512, IoPriority::Scrub);
    assert_eq!(dev.outstanding(), 4);

    dev.drain();
    assert_eq!(done.lock().len(), 10);
    assert!(queue.stats().peak_total_active <= 4);
}

#[test]
fn higher_class_wins_once_floors_are_met() {
    let mut cfg = no_aggregation();
    cfg.max_active = 2;
    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(0, 2);
    *cfg.limits_mut(IoPriority::AsyncRead) = ClassLimits::new(0, 3);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_read(&queue, &done, 0, 512, IoPriority::AsyncRead);
    submit_read(&queue, &done, 65_536, 512, IoPriority::AsyncRead);
    submit_read(&queue, &done, 131_072, 512, IoPriority::AsyncRead);
    submit_read(&queue, &done, 1 << 24, 512, IoPriority::SyncRead);

    dev.complete_next();
    // The freed slot goes to the sync read, not the older async read.
    assert_eq!(dev.issued_offsets()[2], 1 << 24);
    dev.drain();
    assert_eq!(done.lock().len(), 4);
}

#[test]
fn adjacent_reads_aggregate_and_split_exactly() {
    let mut cfg = VdevQueueConfig::default();
    cfg.max_active = 1;
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_read(&queue, &done, 1 << 20, 4096, IoPriority::SyncRead);
    submit_read(&queue, &done, 12_288, 4096, IoPriority::SyncRead);
    submit_read(&queue, &done, 0, 4096, IoPriority::SyncRead);
    submit_read(&queue, &done, 4096, 4096, IoPriority::AsyncRead);
    submit_read(&queue, &done, 200_000, 4096, IoPriority::SyncRead);

    dev.complete_next();
    // The 8 KiB hole before 12_288 is read and discarded. The async read
    // at 4096 belongs to another class and does not join.
    assert_eq!(
        dev.issued()[1],
        DeviceOp::Read {
            offset: 0,
            len: 16_384
        }
    );
    dev.drain();
    assert_eq!(
        dev.issued()[2..],
        [
            DeviceOp::Read {
                offset: 200_000,
                len: 4096
            },
            DeviceOp::Read {
                offset: 4096,
                len: 4096
            },
        ]
    );

    let done = done.lock();
    assert_eq!(done.len(), 5);
    for (offset, res) in done.iter() {
        let out = res.as_ref().expect("read ok");
        let expected: Vec<u8> = (*offset..*offset + 4096).map(pattern).collect();
        assert_eq!(out.data, expected, "member at {offset}");
    }
    assert_eq!(queue.stats().aggregated, 1);
}

#[test]
fn write_aggregation_leaves_unowned_bytes_alone() {
    let mut cfg = VdevQueueConfig::default();
    *cfg.limits_mut(IoPriority::AsyncWrite) = ClassLimits::new(1, 1);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_write(&queue, &done, 1 << 20, vec![9; 512], IoPriority::AsyncWrite);
    submit_write(&queue, &done, 1024, vec![2; 512], IoPriority::AsyncWrite);
    submit_write(&queue, &done, 0, vec![1; 512], IoPriority::AsyncWrite);
    submit_write(&queue, &done, 1536, vec![3; 512], IoPriority::AsyncWrite);
    dev.drain();

    // 0..512 stands alone because 512..1024 belongs to nobody; 1024 and
    // 1536 touch and merge.
    let mut merged = vec![2_u8; 512];
    merged.extend([3_u8; 512]);
    assert_eq!(
        dev.issued()[1..],
        [
            DeviceOp::Write {
                offset: 0,
                data: vec![1; 512]
            },
            DeviceOp::Write {
                offset: 1024,
                data: merged
            },
        ]
    );

    // Replay the device writes over existing contents: the block in the
    // hole keeps its old bytes.
    let mut image: Vec<u8> = (0..4096).map(pattern).collect();
    for op in dev.issued() {
        if let DeviceOp::Write { offset, data } = op {
            let start = usize::try_from(offset).expect("offset");
            if let Some(dst) = image.get_mut(start..start + data.len()) {
                dst.copy_from_slice(&data);
            }
        }
    }
    let hole: Vec<u8> = (512..1024).map(pattern).collect();
    assert_eq!(image[512..1024], hole[..]);
    assert_eq!(image[..512], [1_u8; 512]);
    assert_eq!(image[1536..2048], [3_u8; 512]);

    assert_eq!(queue.stats().aggregated, 1);
    assert!(done.lock().iter().all(|(_, r)| r.as_ref().is_ok_and(|o| o.transferred == 512)));
}

#[test]
fn aggregation_stays_within_the_leader_class() {
    let mut cfg = VdevQueueConfig::default();
    *cfg.limits_mut(IoPriority::Scrub) = ClassLimits::new(1, 1);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_read(&queue, &done, 8192, 512, IoPriority::Scrub);
    submit_read(&queue, &done, 512, 512, IoPriority::Scrub);
    // Adjacent to the waiting scrub read, but scrub is at its ceiling.
    submit_read(&queue, &done, 0, 512, IoPriority::SyncRead);

    assert_eq!(
        dev.issued(),
        vec![
            DeviceOp::Read {
                offset: 8192,
                len: 512
            },
            DeviceOp::Read { offset: 0, len: 512 },
        ]
    );
    let snap = queue.snapshot();
    assert_eq!(snap.active[IoPriority::Scrub.index()], 1);
    assert_eq!(snap.pending[IoPriority::Scrub.index()], 1);

    dev.drain();
    let stats = queue.stats();
    assert_eq!(stats.peak_active[IoPriority::Scrub.index()], 1);
    assert_eq!(stats.aggregated, 0);
    assert_eq!(dev.issued().len(), 3);
    assert_eq!(done.lock().len(), 3);
}

#[test]
fn reads_and_writes_never_share_an_operation() {
    let mut cfg = VdevQueueConfig::default();
    cfg.max_active = 1;
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_read(&queue, &done, 1 << 20, 512, IoPriority::SyncRead);
    submit_read(&queue, &done, 0, 512, IoPriority::SyncRead);
    submit_write(&queue, &done, 512, vec![1; 512], IoPriority::SyncWrite);
    dev.drain();

    let issued = dev.issued();
    assert_eq!(issued.len(), 3);
    assert_eq!(issued[1], DeviceOp::Read { offset: 0, len: 512 });
}

#[test]
fn device_error_fans_out_to_every_member() {
    let mut cfg = VdevQueueConfig::default();
    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(1, 1);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    submit_read(&queue, &done, 1 << 20, 512, IoPriority::SyncRead);
    submit_read(&queue, &done, 0, 512, IoPriority::SyncRead);
    submit_read(&queue, &done, 512, 512, IoPriority::SyncRead);
    dev.complete_next();

    let error = ZcError::DeviceIo {
        vdev: 0,
        offset: 0,
        errno: None,
        transient: false,
        detail: "medium error".into(),
    };
    assert!(dev.fail_next(error.clone()));
    let done = done.lock();
    let failures: Vec<_> = done.iter().filter(|(_, r)| r.is_err()).collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|(_, r)| r.as_ref().err() == Some(&error)));
    assert_eq!(queue.stats().errors, 1);
}

#[test]
fn removal_cancels_everything_and_ignores_late_completions() {
    let mut cfg = no_aggregation();
    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(2, 2);
    let (queue, dev) = manual_queue(cfg, None);
    let done: Completions = Arc::default();

    for i in 0..5 {
        submit_read(&queue, &done, i * 65_536, 512, IoPriority::SyncRead);
    }
    assert_eq!(dev.outstanding(), 2);
    assert_eq!(queue.remove(), 5);
    {
        let done = done.lock();
        assert_eq!(done.len(), 5);
        assert!(
            done.iter()
                .all(|(_, r)| r.as_ref().err() == Some(&ZcError::DeviceGone { vdev: 0 }))
        );
    }

    dev.drain();
    assert_eq!(done.lock().len(), 5, "no callback fires twice");
    let stats = queue.stats();
    assert_eq!(stats.cancelled, 5);
    assert_eq!(stats.late_completions, 2);
    assert_eq!(queue.snapshot().total_active, 0);

    let err = queue
        .submit(
            &Cx::for_testing(),
            IoRequest::read(0, 512, IoPriority::SyncRead, |_| {}),
        )
        .expect_err("removed");
    assert_eq!(err, ZcError::DeviceGone { vdev: 0 });
}

#[test]
fn async_write_concurrency_follows_dirty_data() {
    let gauge = Arc::new(FixedGauge {
        dirty: AtomicU64::new(0),
        max: 1_000_000,
    });
    let (queue, dev) = manual_queue(no_aggregation(), Some(gauge.clone()));
    let done: Completions = Arc::default();

    for i in 0..12 {
        submit_write(&queue, &done, i * 65_536, vec![0; 512], IoPriority::AsyncWrite);
    }
    assert_eq!(dev.outstanding(), 1);
    assert_eq!(queue.snapshot().async_write_max_active, 1);

    gauge.dirty.store(450_000, Ordering::SeqCst);
    queue.reschedule();
    assert_eq!(dev.outstanding(), 5);

    gauge.dirty.store(1_000_000, Ordering::SeqCst);
    queue.reschedule();
    assert_eq!(dev.outstanding(), 10);

    dev.drain();
    assert_eq!(done.lock().len(), 12);
}

#[test]
fn raised_limits_take_effect_after_reschedule() {
    let mut cfg = no_aggregation();
    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(1, 1);
    let (queue, dev) = manual_queue(cfg.clone(), None);
    let done: Completions = Arc::default();

    for i in 0..4 {
        submit_read(&queue, &done, i * 65_536, 512, IoPriority::SyncRead);
    }
    assert_eq!(dev.outstanding(), 1);

    *cfg.limits_mut(IoPriority::SyncRead) = ClassLimits::new(1, 4);
    assert_eq!(queue.config().publish(cfg), 1);
    queue.reschedule();
    assert_eq!(dev.outstanding(), 4);
    assert_eq!(queue.snapshot().config_version, 1);
    dev.drain();
}

#[test]
fn worker_device_under_concurrent_submitters() {
    let mem = Arc::new(MemDevice::new(VdevId(1), 1 << 20));
    let inner: Arc<dyn DeviceBackend> = mem.clone();
    let backend: Arc<dyn DeviceBackend> = Arc::new(WorkerDevice::new(
        VdevId(1),
        inner,
        4,
        Duration::from_micros(200),
    ));
    let mut cfg = VdevQueueConfig::default();
    cfg.max_active = 6;
    let queue = VdevQueue::new(VdevId(1), backend, Arc::new(ConfigCell::new("vdev", cfg)), None);

    let (tx, rx) = mpsc::channel();
    let submitters: Vec<_> = (0..4_u64)
        .map(|t| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            std::thread::spawn(move || {
                let cx = Cx::for_testing();
                for i in 0..25_u64 {
                    let offset = (t * 25 + i) * 8192;
                    let prio = if i % 3 == 0 {
                        IoPriority::AsyncWrite
                    } else {
                        IoPriority::SyncWrite
                    };
                    let tx = tx.clone();
                    queue
                        .submit(
                            &cx,
                            IoRequest::write(offset, vec![7; 4096], prio, move |res| {
                                let _ = tx.send(res.is_ok());
                            }),
                        )
                        .expect("submit");
                }
            })
        })
        .collect();
    for handle in submitters {
        handle.join().expect("submitter");
    }
    drop(tx);

    let results: Vec<bool> = rx.iter().take(100).collect();
    assert_eq!(results.len(), 100);
    assert!(results.iter().all(|ok| *ok));

    let stats = queue.stats();
    assert!(stats.peak_total_active <= 6);
    assert!(stats.peak_active[IoPriority::SyncWrite.index()] <= 10);
    assert_eq!(stats.completed, 100);
    assert_eq!(mem.peek(8192 * 99, 4), vec![7; 4]);
}

#[test]
fn file_device_behind_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vdev.img");
    std::fs::write(&path, vec![0_u8; 1 << 16]).expect("image");
    let backend: Arc<dyn DeviceBackend> =
        Arc::new(FileDevice::open(VdevId(2), &path).expect("open"));
    let queue = VdevQueue::new(
        VdevId(2),
        backend,
        Arc::new(ConfigCell::new("vdev", VdevQueueConfig::default())),
        None,
    );

    let cx = Cx::for_testing();
    queue
        .write_blocking(&cx, 8192, vec![0x5A; 4096], IoPriority::SyncWrite)
        .expect("write");
    let out = queue
        .read_blocking(&cx, 8192, 4096, IoPriority::SyncRead)
        .expect("read");
    assert_eq!(out.data, vec![0x5A; 4096]);

    let err = queue
        .read_blocking(&cx, 1 << 16, 512, IoPriority::SyncRead)
        .expect_err("past end");
    assert!(matches!(err, ZcError::DeviceIo { vdev: 2, .. }));
    assert_eq!(queue.device_stats().errors, 1);
}
