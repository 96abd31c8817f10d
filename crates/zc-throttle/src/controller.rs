//! Per-pool dirty-data accounting and writer admission.
//!
//! # Logging
//!
//! - **TRACE** `zc::throttle`: `throttle_account`, `throttle_release`
//! - **DEBUG** `zc::throttle`: `throttle_delay`: a writer was held back
//! - **DEBUG** `zc::throttle`: `throttle_wait_cancelled`: a held-back writer's context was cancelled
//! - **INFO**  `zc::throttle`: `throttle_pool_registered`, `throttle_pool_shutdown`
//! - **WARN**  `zc::throttle`: `throttle_over_max`: dirty data passed `dirty_data_max`
//! - **ERROR** `zc::throttle`: `throttle_halted`: release exceeded outstanding dirty data

use crate::config::ThrottleConfig;
use crate::cx_checkpoint;
use crate::delay::admission_delay_for;
use asupersync::Cx;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use zc_error::{Result, ZcError};
use zc_types::{ConfigCell, DirtyGauge, PoolId};

/// Longest uninterrupted sleep of a held-back writer between checkpoints
/// of its context.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Point-in-time view of one pool's throttle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleSnapshot {
    pub pool: u64,
    pub dirty_bytes: u64,
    /// Bytes ever accounted; `accounted_total - released_total == dirty_bytes`.
    pub accounted_total: u64,
    pub released_total: u64,
    pub dirty_data_max: u64,
    pub delay_threshold: u64,
    pub current_delay_ns: u64,
    pub needs_sync: bool,
    pub writes: u64,
    pub delayed_writes: u64,
    pub total_delay_ns: u64,
    pub shutdown: bool,
    pub halted: bool,
    pub config_version: u64,
}

#[derive(Debug, Default)]
struct Pacing {
    /// Wakeup time handed to the most recent delayed writer.
    last_wakeup: Option<Instant>,
}

struct PoolThrottle {
    pool: PoolId,
    config: Arc<ConfigCell<ThrottleConfig>>,
    dirty: AtomicU64,
    accounted_total: AtomicU64,
    released_total: AtomicU64,
    writes: AtomicU64,
    delayed_writes: AtomicU64,
    total_delay_ns: AtomicU64,
    shutdown: AtomicBool,
    halted: AtomicBool,
    pacing: Mutex<Pacing>,
    wake: Condvar,
}

impl PoolThrottle {
    fn new(pool: PoolId, config: Arc<ConfigCell<ThrottleConfig>>) -> Self {
        Self {
            pool,
            config,
            dirty: AtomicU64::new(0),
            accounted_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            delayed_writes: AtomicU64::new(0),
            total_delay_ns: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            pacing: Mutex::new(Pacing::default()),
            wake: Condvar::new(),
        }
    }

    fn check_halted(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(ZcError::Halted { subsystem: "throttle" });
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        self.check_halted()?;
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ZcError::PoolShutdown { pool: self.pool.0 });
        }
        Ok(())
    }

    fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    fn current_delay(&self, cfg: &ThrottleConfig) -> Duration {
        admission_delay_for(cfg, self.dirty())
    }

    /// Wake sleeping writers. Taking the pacing lock orders the wakeup
    /// after any writer that has computed its delay but not yet parked.
    fn notify_writers(&self) {
        let _pacing = self.pacing.lock();
        self.wake.notify_all();
    }
}

impl DirtyGauge for PoolThrottle {
    fn dirty_bytes(&self) -> u64 {
        self.dirty()
    }

    fn dirty_max(&self) -> u64 {
        self.config.load().value.dirty_data_max
    }
}

/// Tracks dirty data for every registered pool and paces writers.
///
/// Counters are atomics; the only lock on the write path is the per-pool
/// pacing mutex a delayed writer sleeps on.
pub struct DirtyDataController {
    config: Arc<ConfigCell<ThrottleConfig>>,
    pools: RwLock<HashMap<PoolId, Arc<PoolThrottle>>>,
}

impl fmt::Debug for DirtyDataController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyDataController")
            .field("config_version", &self.config.version())
            .field("pools", &self.pools.read().len())
            .finish()
    }
}

impl DirtyDataController {
    pub fn new(config: Arc<ConfigCell<ThrottleConfig>>) -> Result<Self> {
        config.load().value.validate()?;
        Ok(Self {
            config,
            pools: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigCell<ThrottleConfig>> {
        &self.config
    }

    fn pool(&self, pool: PoolId) -> Result<Arc<PoolThrottle>> {
        self.pools
            .read()
            .get(&pool)
            .cloned()
            .ok_or(ZcError::UnknownPool(pool.0))
    }

    /// Start tracking `pool` with a zero dirty counter.
    pub fn register_pool(&self, pool: PoolId) -> Result<()> {
        let mut pools = self.pools.write();
        if pools.contains_key(&pool) {
            return Err(ZcError::InvalidArgument(format!(
                "pool {} already registered",
                pool.0
            )));
        }
        pools.insert(pool, Arc::new(PoolThrottle::new(pool, Arc::clone(&self.config))));
        drop(pools);
        info!(target: "zc::throttle", pool = pool.0, "throttle_pool_registered");
        Ok(())
    }

    /// Stop tracking `pool`. Outstanding dirty data is discarded with it.
    pub fn unregister_pool(&self, pool: PoolId) -> Result<()> {
        let removed = self
            .pools
            .write()
            .remove(&pool)
            .ok_or(ZcError::UnknownPool(pool.0))?;
        removed.shutdown.store(true, Ordering::Release);
        removed.notify_writers();
        Ok(())
    }

    /// Add `bytes` to the pool's dirty counter. Returns the new total.
    pub fn account_write(&self, pool: PoolId, bytes: u64) -> Result<u64> {
        let state = self.pool(pool)?;
        state.check_open()?;
        let dirty = state.dirty.fetch_add(bytes, Ordering::AcqRel) + bytes;
        state.accounted_total.fetch_add(bytes, Ordering::Relaxed);
        state.writes.fetch_add(1, Ordering::Relaxed);
        let max = self.config.load().value.dirty_data_max;
        if dirty >= max && dirty - bytes < max {
            warn!(target: "zc::throttle", pool = pool.0, dirty, max, "throttle_over_max");
        }
        trace!(target: "zc::throttle", pool = pool.0, bytes, dirty, "throttle_account");
        Ok(dirty)
    }

    /// Delay a writer would owe right now.
    pub fn admission_delay(&self, pool: PoolId) -> Result<Duration> {
        let state = self.pool(pool)?;
        state.check_halted()?;
        Ok(state.current_delay(&self.config.load().value))
    }

    /// Sleep for the current admission delay.
    ///
    /// Consecutive delayed writers are paced: each wakes no earlier than
    /// one delay after the previous writer's wakeup. A release that brings
    /// the delay back to zero wakes sleepers early. Shutdown of the pool
    /// wakes them with `PoolShutdown`. The caller's `cx` is checkpointed on
    /// entry and at least every 10 ms while asleep; cancellation
    /// ends the wait with `Cancelled`. Returns the time actually slept.
    pub fn wait_for_admission(&self, cx: &Cx, pool: PoolId) -> Result<Duration> {
        cx_checkpoint(cx)?;
        let state = self.pool(pool)?;
        let cfg = self.config.load();
        let start = Instant::now();
        let mut pacing = state.pacing.lock();
        state.check_open()?;
        let delay = state.current_delay(&cfg.value);
        if delay.is_zero() {
            return Ok(Duration::ZERO);
        }
        let wakeup = match pacing.last_wakeup {
            Some(last) => (start + delay).max(last + delay),
            None => start + delay,
        };
        pacing.last_wakeup = Some(wakeup);
        state.delayed_writes.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "zc::throttle",
            pool = pool.0,
            dirty = state.dirty(),
            delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX),
            wait_ns = u64::try_from(wakeup.saturating_duration_since(start).as_nanos()).unwrap_or(u64::MAX),
            "throttle_delay"
        );

        let outcome = loop {
            if let Err(err) = state.check_open() {
                break Err(err);
            }
            if let Err(err) = cx_checkpoint(cx) {
                debug!(target: "zc::throttle", pool = pool.0, "throttle_wait_cancelled");
                break Err(err);
            }
            if state.current_delay(&self.config.load().value).is_zero() {
                break Ok(());
            }
            let now = Instant::now();
            if now >= wakeup {
                break Ok(());
            }
            let _ = state.wake.wait_until(&mut pacing, wakeup.min(now + CANCEL_POLL));
        };
        drop(pacing);

        let slept = start.elapsed();
        state.total_delay_ns.fetch_add(
            u64::try_from(slept.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        outcome.map(|()| slept)
    }

    /// Remove `bytes` from the pool's dirty counter after they were made
    /// durable. Releasing more than is outstanding halts the pool.
    pub fn release(&self, pool: PoolId, bytes: u64) -> Result<u64> {
        let state = self.pool(pool)?;
        state.check_halted()?;
        let previous = state
            .dirty
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |dirty| dirty.checked_sub(bytes));
        match previous {
            Ok(previous) => {
                state.released_total.fetch_add(bytes, Ordering::Relaxed);
                let dirty = previous - bytes;
                trace!(target: "zc::throttle", pool = pool.0, bytes, dirty, "throttle_release");
                state.notify_writers();
                Ok(dirty)
            }
            Err(outstanding) => {
                state.halted.store(true, Ordering::Release);
                state.notify_writers();
                error!(
                    target: "zc::throttle",
                    pool = pool.0,
                    bytes,
                    outstanding,
                    "throttle_halted"
                );
                Err(ZcError::InvariantViolation(format!(
                    "pool {}: release of {bytes} bytes with only {outstanding} outstanding",
                    pool.0
                )))
            }
        }
    }

    /// Whether the pool holds enough dirty data to warrant a sync.
    pub fn needs_sync(&self, pool: PoolId) -> Result<bool> {
        let state = self.pool(pool)?;
        state.check_halted()?;
        Ok(state.dirty() >= self.config.load().value.dirty_data_sync)
    }

    /// Refuse further writes and wake every sleeping writer with
    /// `PoolShutdown`. Releases are still accepted so sync can drain.
    pub fn shutdown(&self, pool: PoolId) -> Result<()> {
        let state = self.pool(pool)?;
        state.shutdown.store(true, Ordering::Release);
        state.notify_writers();
        info!(
            target: "zc::throttle",
            pool = pool.0,
            dirty = state.dirty(),
            "throttle_pool_shutdown"
        );
        Ok(())
    }

    pub fn snapshot(&self, pool: PoolId) -> Result<ThrottleSnapshot> {
        let state = self.pool(pool)?;
        let cfg = self.config.load();
        let dirty = state.dirty();
        Ok(ThrottleSnapshot {
            pool: pool.0,
            dirty_bytes: dirty,
            accounted_total: state.accounted_total.load(Ordering::Relaxed),
            released_total: state.released_total.load(Ordering::Relaxed),
            dirty_data_max: cfg.value.dirty_data_max,
            delay_threshold: cfg.value.delay_threshold(),
            current_delay_ns: u64::try_from(admission_delay_for(&cfg.value, dirty).as_nanos())
                .unwrap_or(u64::MAX),
            needs_sync: dirty >= cfg.value.dirty_data_sync,
            writes: state.writes.load(Ordering::Relaxed),
            delayed_writes: state.delayed_writes.load(Ordering::Relaxed),
            total_delay_ns: state.total_delay_ns.load(Ordering::Relaxed),
            shutdown: state.shutdown.load(Ordering::Acquire),
            halted: state.halted.load(Ordering::Acquire),
            config_version: cfg.version,
        })
    }

    /// Live view of the pool's dirty data for the device scheduler.
    pub fn gauge(&self, pool: PoolId) -> Result<Arc<dyn DirtyGauge>> {
        let state: Arc<dyn DirtyGauge> = self.pool(pool)?;
        Ok(state)
    }
}
