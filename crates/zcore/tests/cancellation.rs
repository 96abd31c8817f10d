#![forbid(unsafe_code)]
//! Cancelled contexts stop pool operations without disturbing accounting.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zcore::{
    BlockKey, Cx, MemDevice, PoolBuilder, PoolId, StoragePool, ThrottleConfig, VdevId, ZcError,
};

const BLOCK: u32 = 4096;

fn key(index: u64) -> BlockKey {
    BlockKey::new(VdevId(0), index * u64::from(BLOCK), BLOCK)
}

fn pool_with(throttle: ThrottleConfig) -> StoragePool {
    PoolBuilder::new(PoolId(9))
        .throttle_config(throttle)
        .device(VdevId(0), Arc::new(MemDevice::new(VdevId(0), 1 << 20)))
        .build()
        .expect("pool")
}

fn cancelled() -> Cx {
    let cx = Cx::for_testing();
    cx.set_cancel_requested(true);
    cx
}

#[test]
fn cancelled_read_returns_cancelled_and_issues_nothing() {
    let pool = pool_with(ThrottleConfig::default());
    assert_eq!(pool.read(&cancelled(), key(3)).map(|_| ()), Err(ZcError::Cancelled));

    let stats = pool.stats().expect("stats");
    assert_eq!(stats.queues[0].stats.submitted, 0);
    assert!(pool.read(&Cx::for_testing(), key(3)).is_ok());
}

#[test]
fn cancelled_sync_keeps_dirty_data_accounted() {
    let pool = pool_with(ThrottleConfig::default());
    let cx = Cx::for_testing();
    for i in 0..4 {
        pool.write(&cx, key(i), vec![1; BLOCK as usize]).expect("write");
    }

    assert_eq!(pool.sync(&cancelled()), Err(ZcError::Cancelled));
    let stats = pool.stats().expect("stats");
    assert_eq!(stats.unsynced_bytes, 4 * u64::from(BLOCK));
    assert_eq!(stats.throttle.dirty_bytes, 4 * u64::from(BLOCK));
    assert_eq!(stats.arc.dirty_bytes, 4 * u64::from(BLOCK));

    let report = pool.sync(&cx).expect("sync");
    assert_eq!(report.released, 4 * u64::from(BLOCK));
}

#[test]
fn throttled_writer_leaves_when_its_context_is_cancelled() {
    let pool = pool_with(ThrottleConfig {
        dirty_data_max: 4 * u64::from(BLOCK),
        dirty_data_sync: 4 * u64::from(BLOCK),
        delay_max: Duration::from_secs(10),
        delay_min_dirty_percent: 10,
        ..ThrottleConfig::default()
    });
    let live = Cx::for_testing();
    for i in 0..4 {
        pool.write(&live, key(i), vec![2; BLOCK as usize]).expect("fill");
    }

    let writer_cx = Cx::for_testing();
    let (res, waited) = thread::scope(|s| {
        let writer = s.spawn(|| {
            let start = Instant::now();
            let res = pool.write(&writer_cx, key(8), vec![3; BLOCK as usize]);
            (res, start.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        writer_cx.set_cancel_requested(true);
        writer.join().expect("join")
    });
    assert_eq!(res, Err(ZcError::Cancelled));
    assert!(waited < Duration::from_secs(5), "writer slept {waited:?}");

    // The refused write was never admitted.
    let stats = pool.stats().expect("stats");
    assert_eq!(stats.throttle.dirty_bytes, 4 * u64::from(BLOCK));
    assert_eq!(pool.sync(&live).expect("sync").released, 4 * u64::from(BLOCK));
}
