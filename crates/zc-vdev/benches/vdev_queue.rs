#![forbid(unsafe_code)]

use asupersync::Cx;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use zc_types::{ConfigCell, IoPriority, VdevId};
use zc_vdev::{DeviceBackend, IoRequest, MemDevice, VdevQueue, VdevQueueConfig};

fn make_queue(device_bytes: usize, cfg: VdevQueueConfig) -> Arc<VdevQueue> {
    let backend: Arc<dyn DeviceBackend> = Arc::new(MemDevice::new(VdevId(0), device_bytes));
    VdevQueue::new(VdevId(0), backend, Arc::new(ConfigCell::new("bench", cfg)), None)
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_sync_read_4k(c: &mut Criterion) {
    let cx = Cx::for_testing();
    let queue = make_queue(1 << 20, VdevQueueConfig::default());
    let mut block = 0_u64;
    c.bench_function("vdev_queue_sync_read_4k", |b| {
        b.iter(|| {
            let out = queue
                .read_blocking(&cx, black_box((block % 256) * 4096), 4096, IoPriority::SyncRead)
                .expect("read");
            block += 1;
            out
        });
    });
}

fn bench_async_write_batch(c: &mut Criterion) {
    // 64 contiguous 4 KiB writes per iteration; the in-memory device
    // completes inline, so each submit issues immediately.
    let cx = Cx::for_testing();
    let queue = make_queue(1 << 20, VdevQueueConfig::default());
    c.bench_function("vdev_queue_async_write_batch_64x4k", |b| {
        b.iter(|| {
            for i in 0..64_u64 {
                queue
                    .submit(
                        &cx,
                        IoRequest::write(i * 4096, vec![0xA5; 4096], IoPriority::AsyncWrite, |res| {
                            black_box(res.is_ok());
                        }),
                    )
                    .expect("submit");
            }
        });
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let cx = Cx::for_testing();
    let queue = make_queue(1 << 16, VdevQueueConfig::default());
    for i in 0..16_u64 {
        let _ = queue
            .read_blocking(&cx, i * 4096, 4096, IoPriority::AsyncRead)
            .expect("warmup");
    }
    c.bench_function("vdev_queue_snapshot", |b| {
        b.iter(|| {
            let _s = queue.snapshot();
        });
    });
}

criterion_group!(
    queue_benches,
    bench_sync_read_4k,
    bench_async_write_batch,
    bench_snapshot,
);
criterion_main!(queue_benches);
