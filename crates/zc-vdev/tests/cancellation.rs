#![forbid(unsafe_code)]

use asupersync::Cx;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use zc_error::ZcError;
use zc_types::{ConfigCell, IoPriority, VdevId};
use zc_vdev::{DeviceBackend, IoRequest, MemDevice, VdevQueue, VdevQueueConfig};

fn mem_queue() -> Arc<VdevQueue> {
    let backend: Arc<dyn DeviceBackend> = Arc::new(MemDevice::new(VdevId(0), 1 << 16));
    VdevQueue::new(
        VdevId(0),
        backend,
        Arc::new(ConfigCell::new("vdev", VdevQueueConfig::default())),
        None,
    )
}

#[test]
fn cancelled_context_is_refused_before_queueing() {
    let queue = mem_queue();
    let cx = Cx::for_testing();
    cx.set_cancel_requested(true);

    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let res = queue.submit(
        &cx,
        IoRequest::read(0, 512, IoPriority::SyncRead, move |_| {
            flag.store(true, Ordering::SeqCst);
        }),
    );
    assert_eq!(res, Err(ZcError::Cancelled));
    assert!(!called.load(Ordering::SeqCst));

    let stats = queue.stats();
    assert_eq!(stats.submitted, 0);
    assert_eq!(stats.issued, 0);
}

#[test]
fn cancelled_blocking_write_leaves_the_device_untouched() {
    let queue = mem_queue();
    let cancelled = Cx::for_testing();
    cancelled.set_cancel_requested(true);

    assert_eq!(
        queue
            .write_blocking(&cancelled, 4096, vec![0xEE; 4096], IoPriority::SyncWrite)
            .map(|_| ()),
        Err(ZcError::Cancelled)
    );

    // A cancelled caller does not poison the queue for everyone else.
    let live = Cx::for_testing();
    let outcome = queue
        .read_blocking(&live, 4096, 4096, IoPriority::SyncRead)
        .expect("read");
    assert!(outcome.data.iter().all(|b| *b == 0));
    assert_eq!(queue.stats().submitted, 1);
}
