//! The concurrent cache front end.
//!
//! # Logging
//!
//! - **TRACE** `zc::arc`: `arc_hit`, `arc_miss`, `arc_insert`: per-request path
//! - **DEBUG** `zc::arc`: `arc_ghost_hit`: adaptation target moved
//! - **DEBUG** `zc::arc`: `arc_evict`, `arc_reclaim`: eviction runs
//! - **DEBUG** `zc::arc`: `arc_config_applied`: a new configuration version was adopted
//! - **INFO**  `zc::arc`: `arc_init`, `arc_memory_pressure`
//! - **WARN**  `zc::arc`: `arc_admission_failed`, `arc_fill_uncached`, `arc_fill_error`
//! - **WARN**  `zc::arc`: `arc_config_over_limit`: a lowered `c_max` left pinned or dirty bytes above it
//! - **ERROR** `zc::arc`: `arc_halted`: invariant violation, cache stopped

use crate::buf::{ArcBuf, ArcHandle};
use crate::config::{AdmissionPolicy, ArcConfig};
use crate::cx_checkpoint;
use crate::list::ListId;
use crate::source::BlockSource;
use crate::state::{ArcState, MemoryPressure};
use crate::stats::{ArcStats, Counters};
use asupersync::Cx;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use zc_error::{Result, ZcError};
use zc_types::{BlockKey, ConfigCell, IoPriority};

/// Completion for an asynchronous fetch. Invoked exactly once.
pub type FetchCallback = Box<dyn FnOnce(Result<ArcHandle>) + Send + 'static>;

/// What a reclaim or memory-pressure call achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimOutcome {
    pub freed_bytes: u64,
    pub evicted: u64,
    pub passes: u32,
    pub resident_bytes: u64,
    pub target: u64,
    /// Resident bytes stayed above target because the remaining entries
    /// are pinned or dirty.
    pub blocked: bool,
}

struct InFlightRead {
    waiters: Vec<FetchCallback>,
    install: ListId,
}

/// Adaptive replacement cache over a [`BlockSource`].
///
/// Resident bytes never exceed `c_max` at operation boundaries, with one
/// exception: lowering `c_max` below what is pinned or dirty leaves the
/// excess resident, logs `arc_config_over_limit`, and counts it in
/// [`ArcStats::config_over_limit`]. Later evictions work back toward the new
/// limit. Misses read through the source; concurrent misses for one block
/// share a single read.
///
/// Lock order is list state, then the in-flight table. No lock is held
/// across a source read or a user callback.
pub struct ArcCache {
    config: Arc<ConfigCell<ArcConfig>>,
    source: Arc<dyn BlockSource>,
    state: Mutex<ArcState>,
    inflight: Mutex<HashMap<BlockKey, InFlightRead>>,
    counters: Counters,
    halted: AtomicBool,
}

impl fmt::Debug for ArcCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcCache")
            .field("config_version", &self.config.version())
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

impl ArcCache {
    pub fn new(config: Arc<ConfigCell<ArcConfig>>, source: Arc<dyn BlockSource>) -> Result<Arc<Self>> {
        let snapshot = config.load();
        snapshot.value.validate()?;
        info!(
            target: "zc::arc",
            c_max = snapshot.value.c_max,
            c_min = snapshot.value.c_min,
            ghost_limit = snapshot.value.ghost_limit(),
            "arc_init"
        );
        Ok(Arc::new(Self {
            state: Mutex::new(ArcState::new(&snapshot)),
            config,
            source,
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            halted: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigCell<ArcConfig>> {
        &self.config
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn halted_error() -> ZcError {
        ZcError::Halted { subsystem: "arc" }
    }

    /// Lock the list state after picking up any newer configuration.
    fn locked(&self) -> Result<MutexGuard<'_, ArcState>> {
        if self.is_halted() {
            return Err(Self::halted_error());
        }
        let mut st = self.state.lock();
        self.sync_config(&mut st);
        Ok(st)
    }

    fn sync_config(&self, st: &mut ArcState) {
        let cfg = self.config.load();
        let Some(adoption) = st.apply_config(&cfg, &self.counters) else {
            return;
        };
        debug!(
            target: "zc::arc",
            version = cfg.version,
            c_max = cfg.value.c_max,
            c_min = cfg.value.c_min,
            resident = st.resident_bytes(),
            "arc_config_applied"
        );
        if adoption.over_limit {
            Counters::bump(&self.counters.config_over_limit);
            warn!(
                target: "zc::arc",
                version = cfg.version,
                c_max = cfg.value.c_max,
                resident = st.resident_bytes(),
                dirty = st.dirty_bytes(),
                "arc_config_over_limit"
            );
        }
    }

    fn halt(&self, reason: String) -> ZcError {
        self.halted.store(true, Ordering::Release);
        error!(target: "zc::arc", reason = %reason, "arc_halted");
        ZcError::InvariantViolation(reason)
    }

    fn check_key(key: BlockKey) -> Result<()> {
        if key.size == 0 {
            return Err(ZcError::InvalidArgument(format!("zero-sized block {key}")));
        }
        Ok(())
    }

    /// Cache-only lookup. A resident hit counts as an access; no I/O and no
    /// adaptation happen here.
    pub fn lookup(&self, key: BlockKey) -> Result<Option<ArcHandle>> {
        let mut st = self.locked()?;
        let hit = st.hit(key, Instant::now(), &self.counters);
        drop(st);
        if hit.is_none() {
            Counters::bump(&self.counters.misses);
        }
        trace!(target: "zc::arc", key = %key, hit = hit.is_some(), "arc_lookup");
        Ok(hit)
    }

    /// Read `key`, blocking the caller until the data is available.
    ///
    /// `cx` is checkpointed on entry and again after the data arrives.
    pub fn fetch(self: &Arc<Self>, cx: &Cx, key: BlockKey) -> Result<ArcHandle> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.fetch_async(cx, key, move |res| {
            let _ = tx.send(res);
        });
        let handle = rx.recv().map_err(|_| ZcError::Cancelled)??;
        cx_checkpoint(cx)?;
        Ok(handle)
    }

    /// Read `key`. `done` runs inline on a hit or a cancelled `cx`, and
    /// from the read completion on a miss.
    pub fn fetch_async(
        self: &Arc<Self>,
        cx: &Cx,
        key: BlockKey,
        done: impl FnOnce(Result<ArcHandle>) + Send + 'static,
    ) {
        self.start_fetch(cx, key, IoPriority::SyncRead, Box::new(done));
    }

    /// Warm the cache with `key` at background priority.
    pub fn prefetch(self: &Arc<Self>, cx: &Cx, key: BlockKey) -> Result<()> {
        cx_checkpoint(cx)?;
        Self::check_key(key)?;
        if self.is_halted() {
            return Err(Self::halted_error());
        }
        self.start_fetch(cx, key, IoPriority::AsyncRead, Box::new(|_| {}));
        Ok(())
    }

    fn start_fetch(
        self: &Arc<Self>,
        cx: &Cx,
        key: BlockKey,
        priority: IoPriority,
        done: FetchCallback,
    ) {
        if let Err(err) = cx_checkpoint(cx).and_then(|()| Self::check_key(key)) {
            done(Err(err));
            return;
        }
        let now = Instant::now();
        let (ghost, start_read, p) = {
            let mut st = match self.locked() {
                Ok(st) => st,
                Err(err) => {
                    done(Err(err));
                    return;
                }
            };
            if let Some(handle) = st.hit(key, now, &self.counters) {
                drop(st);
                trace!(target: "zc::arc", key = %key, "arc_hit");
                done(Ok(handle));
                return;
            }
            let ghost = st.ghost_hit(key, &self.counters);
            Counters::bump(&self.counters.misses);
            st.grow(key.len_bytes(), now);
            let install = if ghost.is_some() {
                ListId::Mfu
            } else {
                ListId::Mru
            };
            let mut inflight = self.inflight.lock();
            let start_read = match inflight.entry(key) {
                MapEntry::Occupied(mut read) => {
                    let read = read.get_mut();
                    read.waiters.push(done);
                    if ghost.is_some() {
                        read.install = ListId::Mfu;
                    }
                    Counters::bump(&self.counters.coalesced_reads);
                    false
                }
                MapEntry::Vacant(slot) => {
                    slot.insert(InFlightRead {
                        waiters: vec![done],
                        install,
                    });
                    true
                }
            };
            (ghost, start_read, st.p())
        };

        if let Some(list) = ghost {
            debug!(target: "zc::arc", key = %key, list = list.as_str(), p, "arc_ghost_hit");
        }
        trace!(target: "zc::arc", key = %key, joined = !start_read, "arc_miss");
        if !start_read {
            return;
        }
        let cache = Arc::clone(self);
        let submitted = self.source.read_block(
            cx,
            key,
            priority,
            Box::new(move |res| cache.finish_fill(key, res)),
        );
        if let Err(err) = submitted {
            self.finish_fill(key, Err(err));
        }
    }

    fn finish_fill(&self, key: BlockKey, result: Result<Vec<u8>>) {
        let data = result.and_then(|data| {
            if data.len() == key.size as usize {
                Ok(data)
            } else {
                Err(ZcError::DeviceIo {
                    vdev: key.vdev.0,
                    offset: key.offset.0,
                    errno: None,
                    transient: false,
                    detail: format!("short read: {} of {} bytes", data.len(), key.size),
                })
            }
        });

        let data = match data {
            Ok(data) => data,
            Err(err) => {
                let waiters = self
                    .inflight
                    .lock()
                    .remove(&key)
                    .map(|read| read.waiters)
                    .unwrap_or_default();
                Counters::bump(&self.counters.io_errors);
                warn!(
                    target: "zc::arc",
                    key = %key,
                    waiters = waiters.len(),
                    error = %err,
                    "arc_fill_error"
                );
                for done in waiters {
                    done(Err(err.clone()));
                }
                return;
            }
        };

        let delivery = {
            let mut st = self.state.lock();
            let read = self.inflight.lock().remove(&key);
            let Some(read) = read else {
                return;
            };
            if self.is_halted() {
                Err(read.waiters)
            } else {
                self.sync_config(&mut st);
                let (buf, cached) = if let Some(buf) = st.resident_buf(key) {
                    // A writer installed newer data while the read was in flight.
                    (buf, true)
                } else {
                    let buf = ArcBuf::new(data);
                    if st.make_room(key.len_bytes(), &self.counters) {
                        st.install(key, Arc::clone(&buf), read.install, false, Instant::now());
                        Counters::bump(&self.counters.fills);
                        (buf, true)
                    } else {
                        Counters::bump(&self.counters.uncached_fills);
                        warn!(
                            target: "zc::arc",
                            key = %key,
                            resident = st.resident_bytes(),
                            "arc_fill_uncached"
                        );
                        (buf, false)
                    }
                };
                let handles: Vec<ArcHandle> = read
                    .waiters
                    .iter()
                    .map(|_| ArcHandle::pin(key, &buf, cached))
                    .collect();
                Ok((read.waiters, handles))
            }
        };

        match delivery {
            Ok((waiters, handles)) => {
                for (done, handle) in waiters.into_iter().zip(handles) {
                    done(Ok(handle));
                }
            }
            Err(waiters) => {
                for done in waiters {
                    done(Err(Self::halted_error()));
                }
            }
        }
    }

    /// Insert or overwrite `key` with `data`, setting its dirty flag.
    ///
    /// Evicts only what is needed to stay within `c_max`. When nothing can
    /// be evicted the configured [`AdmissionPolicy`] decides between failing
    /// at once and retrying with backoff; both end in `OutOfCacheSpace`.
    pub fn insert(&self, key: BlockKey, data: Vec<u8>, dirty: bool) -> Result<()> {
        Self::check_key(key)?;
        if data.len() != key.size as usize {
            return Err(ZcError::InvalidArgument(format!(
                "block {key} given {} bytes",
                data.len()
            )));
        }
        let policy = self.config.load().value.admission;
        let (retries, backoff) = match policy {
            AdmissionPolicy::Fail => (0, None),
            AdmissionPolicy::Retry { attempts, backoff } => (attempts, Some(backoff)),
        };
        let buf = ArcBuf::new(data);

        for attempt in 0..=retries {
            {
                let mut st = self.locked()?;
                let now = Instant::now();
                if key.len_bytes() > st.config().c_max {
                    break;
                }
                if st.overwrite(key, &buf, dirty, now) {
                    Counters::bump(&self.counters.inserts);
                    trace!(target: "zc::arc", key = %key, dirty, overwrite = true, "arc_insert");
                    return Ok(());
                }
                st.remove_key(key);
                if st.make_room(key.len_bytes(), &self.counters) {
                    st.install(key, Arc::clone(&buf), ListId::Mru, dirty, now);
                    Counters::bump(&self.counters.inserts);
                    trace!(target: "zc::arc", key = %key, dirty, overwrite = false, "arc_insert");
                    return Ok(());
                }
            }
            Counters::bump(&self.counters.admission_failures);
            if attempt < retries {
                if let Some(backoff) = backoff {
                    std::thread::sleep(backoff);
                }
            }
        }

        warn!(
            target: "zc::arc",
            key = %key,
            attempts = retries + 1,
            "arc_admission_failed"
        );
        Err(ZcError::OutOfCacheSpace {
            requested: key.len_bytes(),
            detail: "every eviction candidate is pinned or dirty".to_owned(),
        })
    }

    /// Move least-recently-used evictable entries to the ghost lists until
    /// `target_bytes` are freed or nothing evictable remains. Returns the
    /// bytes freed.
    pub fn evict(&self, target_bytes: u64) -> Result<u64> {
        let mut st = self.locked()?;
        let run = st.evict_bytes(target_bytes, &self.counters);
        let resident = st.resident_bytes();
        drop(st);
        debug!(
            target: "zc::arc",
            target_bytes,
            freed = run.freed,
            evicted = run.evicted,
            blocked = run.blocked,
            resident,
            "arc_evict"
        );
        Ok(run.freed)
    }

    /// Evict down to the adaptive target `c`.
    pub fn reclaim(&self) -> Result<ReclaimOutcome> {
        let mut st = self.locked()?;
        let run = st.evict_to_target(&self.counters);
        let outcome = ReclaimOutcome {
            freed_bytes: run.freed,
            evicted: run.evicted,
            passes: 1,
            resident_bytes: st.resident_bytes(),
            target: st.c(),
            blocked: run.blocked && st.resident_bytes() > st.c(),
        };
        drop(st);
        debug!(
            target: "zc::arc",
            freed = outcome.freed_bytes,
            resident = outcome.resident_bytes,
            target_bytes = outcome.target,
            "arc_reclaim"
        );
        Ok(outcome)
    }

    /// Shrink the target for `level` and reclaim toward it in a bounded
    /// number of passes, yielding between passes and stopping early when a
    /// pass frees nothing.
    pub fn memory_pressure(&self, level: MemoryPressure) -> Result<ReclaimOutcome> {
        let passes = {
            let mut st = self.locked()?;
            let before = st.c();
            st.shrink(level, Instant::now());
            Counters::bump(&self.counters.pressure_events);
            info!(
                target: "zc::arc",
                level = ?level,
                c_before = before,
                c_after = st.c(),
                resident = st.resident_bytes(),
                "arc_memory_pressure"
            );
            st.config().reclaim_passes.max(1)
        };

        let mut outcome = ReclaimOutcome::default();
        for pass in 0..passes {
            if pass > 0 {
                std::thread::yield_now();
            }
            let mut st = self.locked()?;
            let run = st.evict_to_target(&self.counters);
            outcome.freed_bytes += run.freed;
            outcome.evicted += run.evicted;
            outcome.passes = pass + 1;
            outcome.resident_bytes = st.resident_bytes();
            outcome.target = st.c();
            outcome.blocked = outcome.resident_bytes > outcome.target;
            if !outcome.blocked || run.freed == 0 {
                break;
            }
        }
        Ok(outcome)
    }

    /// Clear the dirty flag of the entry `written` refers to, provided the
    /// entry still holds that buffer. Returns whether it was cleared.
    pub fn mark_clean(&self, written: &ArcHandle) -> Result<bool> {
        let mut st = self.locked()?;
        Ok(st.mark_clean(written.key(), written.buf()))
    }

    /// Pinned handles to all dirty entries, least recently used first.
    pub fn dirty_entries(&self) -> Result<Vec<ArcHandle>> {
        Ok(self.locked()?.dirty_handles())
    }

    /// Drop a freed block from the cache (resident or ghost). Freeing a
    /// pinned block is an invariant violation and halts the cache.
    pub fn free(&self, key: BlockKey) -> Result<()> {
        let mut st = self.locked()?;
        if st.is_pinned(key) {
            drop(st);
            return Err(self.halt(format!("free of pinned block {key}")));
        }
        st.remove_key(key);
        Ok(())
    }

    /// List holding `key`, if any, without counting an access.
    #[must_use]
    pub fn residency(&self, key: BlockKey) -> Option<ListId> {
        self.state.lock().residency(key)
    }

    #[must_use]
    pub fn stats(&self) -> ArcStats {
        let mut stats = ArcStats::default();
        {
            let st = self.state.lock();
            st.fill_gauges(&mut stats);
            stats.inflight_reads = self.inflight.lock().len();
        }
        stats.fill_counters(&self.counters);
        stats.halted = self.is_halted();
        stats
    }
}
