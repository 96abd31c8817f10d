//! Single-threaded replacement state: lists, directory, and adaptation.
//!
//! [`ArcState`] is the algorithm with no locking or I/O. The cache wraps it
//! in a mutex and calls in with the current time and its counters.

use crate::buf::{ArcBuf, ArcHandle};
use crate::config::ArcConfig;
use crate::list::{Arena, EntryIdx, ListId};
use crate::stats::{ArcStats, Counters};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use zc_types::{BlockKey, Versioned};

/// Memory pressure reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemoryPressure {
    /// Shrink the target by `c >> shrink_shift`.
    Moderate,
    /// Drop the target to `c_min`.
    Critical,
}

pub(crate) struct Entry {
    key: BlockKey,
    /// `None` for ghost entries.
    buf: Option<Arc<ArcBuf>>,
    dirty: bool,
    last_access: Instant,
}

impl Entry {
    fn evictable(&self) -> bool {
        !self.dirty && self.buf.as_ref().is_none_or(|b| !b.is_pinned())
    }
}

/// Outcome of adopting a new configuration version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Adoption {
    /// Resident bytes still exceed the new `c_max` because the remainder is
    /// pinned or dirty.
    pub over_limit: bool,
}

/// Result of one eviction run under the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EvictRun {
    pub freed: u64,
    pub evicted: u64,
    /// Stopped because no resident entry was evictable.
    pub blocked: bool,
}

pub(crate) struct ArcState {
    arena: Arena<Entry>,
    directory: HashMap<BlockKey, EntryIdx>,
    p: u64,
    c: u64,
    dirty_bytes: u64,
    last_shrink: Option<Instant>,
    cfg: ArcConfig,
    config_version: u64,
}

impl ArcState {
    pub(crate) fn new(cfg: &Versioned<ArcConfig>) -> Self {
        Self {
            arena: Arena::new(),
            directory: HashMap::new(),
            p: 0,
            c: cfg.value.c_max,
            dirty_bytes: 0,
            last_shrink: None,
            cfg: cfg.value.clone(),
            config_version: cfg.version,
        }
    }

    pub(crate) fn config(&self) -> &ArcConfig {
        &self.cfg
    }

    pub(crate) fn p(&self) -> u64 {
        self.p
    }

    pub(crate) fn c(&self) -> u64 {
        self.c
    }

    pub(crate) fn resident_bytes(&self) -> u64 {
        self.arena.bytes(ListId::Mru) + self.arena.bytes(ListId::Mfu)
    }

    pub(crate) fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes
    }

    /// Adopt a newer configuration: clamp `c` and `p` into the new bounds,
    /// evict down to a lowered `c_max`, and trim the ghost lists.
    ///
    /// Returns `None` when `cfg` is the version already in use.
    pub(crate) fn apply_config(
        &mut self,
        cfg: &Versioned<ArcConfig>,
        counters: &Counters,
    ) -> Option<Adoption> {
        if cfg.version == self.config_version {
            return None;
        }
        self.cfg = cfg.value.clone();
        self.config_version = cfg.version;
        self.c = self.c.clamp(self.cfg.c_min, self.cfg.c_max);
        self.p = self.p.min(self.cfg.c_max);
        let fits = self.make_room(0, counters);
        self.trim_ghost(ListId::MruGhost, counters);
        self.trim_ghost(ListId::MfuGhost, counters);
        Some(Adoption { over_limit: !fits })
    }

    /// List currently holding `key` (resident or ghost), without counting
    /// an access.
    pub(crate) fn residency(&self, key: BlockKey) -> Option<ListId> {
        let idx = *self.directory.get(&key)?;
        self.arena.list_of(idx)
    }

    /// Count an access to a resident `key` and pin it.
    pub(crate) fn hit(&mut self, key: BlockKey, now: Instant, counters: &Counters) -> Option<ArcHandle> {
        let idx = *self.directory.get(&key)?;
        let list = self.arena.list_of(idx)?;
        if list.is_ghost() {
            return None;
        }
        Counters::bump(match list {
            ListId::Mru => &counters.mru_hits,
            _ => &counters.mfu_hits,
        });
        self.touch(idx, list, now);
        let buf = self.arena.get(idx)?.buf.as_ref()?;
        Some(ArcHandle::pin(key, buf, true))
    }

    /// If `key` is a ghost, adapt `p` toward the list it was evicted from
    /// and drop the ghost. Returns the ghost list that was hit.
    pub(crate) fn ghost_hit(&mut self, key: BlockKey, counters: &Counters) -> Option<ListId> {
        let idx = *self.directory.get(&key)?;
        let list = self.arena.list_of(idx)?;
        if !list.is_ghost() {
            return None;
        }
        let size = self.arena.size_of(idx).unwrap_or_else(|| key.len_bytes());
        self.adapt(list, size);
        self.arena.remove(idx);
        self.directory.remove(&key);
        Counters::bump(match list {
            ListId::MruGhost => &counters.mru_ghost_hits,
            _ => &counters.mfu_ghost_hits,
        });
        Some(list)
    }

    /// `p` moves within `[p_min, c - p_min]` where `p_min = c >> p_min_shift`.
    fn adapt(&mut self, ghost: ListId, size: u64) {
        let mru_ghost = self.arena.bytes(ListId::MruGhost).max(1);
        let mfu_ghost = self.arena.bytes(ListId::MfuGhost).max(1);
        let p_min = self.c.checked_shr(self.cfg.p_min_shift).unwrap_or(0);
        match ghost {
            ListId::MruGhost => {
                let delta = size.saturating_mul((mfu_ghost / mru_ghost).max(1));
                self.p = self.p.saturating_add(delta).min(self.c - p_min);
            }
            ListId::MfuGhost => {
                let delta = size.saturating_mul((mru_ghost / mfu_ghost).max(1));
                self.p = self.p.saturating_sub(delta).max(p_min);
            }
            ListId::Mru | ListId::Mfu => {}
        }
    }

    fn touch(&mut self, idx: EntryIdx, list: ListId, now: Instant) {
        let promote_after = self.cfg.promote_after;
        let Some(entry) = self.arena.get_mut(idx) else {
            return;
        };
        let recent = now.saturating_duration_since(entry.last_access) < promote_after;
        entry.last_access = now;
        let target = if list == ListId::Mru && recent {
            ListId::Mru
        } else {
            ListId::Mfu
        };
        self.arena.move_to_head(idx, target);
    }

    /// Grow the target toward `c_max` after a miss, unless a shrink
    /// happened within `grow_retry`.
    pub(crate) fn grow(&mut self, size: u64, now: Instant) {
        if self
            .last_shrink
            .is_some_and(|t| now.saturating_duration_since(t) < self.cfg.grow_retry)
        {
            return;
        }
        self.c = self.c.saturating_add(size).min(self.cfg.c_max);
    }

    pub(crate) fn shrink(&mut self, level: MemoryPressure, now: Instant) {
        self.c = match level {
            MemoryPressure::Moderate => self
                .c
                .saturating_sub(self.c >> self.cfg.shrink_shift)
                .max(self.cfg.c_min),
            MemoryPressure::Critical => self.cfg.c_min,
        };
        self.last_shrink = Some(now);
    }

    /// Evict until `needed` more bytes fit under `c_max`. False when the
    /// request can never fit or every candidate is pinned or dirty.
    pub(crate) fn make_room(&mut self, needed: u64, counters: &Counters) -> bool {
        if needed > self.cfg.c_max {
            return false;
        }
        while self.resident_bytes() + needed > self.cfg.c_max {
            if self.evict_one(counters).is_none() {
                return false;
            }
        }
        true
    }

    /// Evict until at least `target` bytes are freed or nothing is evictable.
    pub(crate) fn evict_bytes(&mut self, target: u64, counters: &Counters) -> EvictRun {
        let mut run = EvictRun::default();
        while run.freed < target {
            match self.evict_one(counters) {
                Some(size) => {
                    run.freed += size;
                    run.evicted += 1;
                }
                None => {
                    run.blocked = true;
                    break;
                }
            }
        }
        run
    }

    /// Evict until resident bytes are at or below the target `c`.
    pub(crate) fn evict_to_target(&mut self, counters: &Counters) -> EvictRun {
        let excess = self.resident_bytes().saturating_sub(self.c);
        self.evict_bytes(excess, counters)
    }

    /// Move one victim to its ghost list. Prefers MRU while MRU holds more
    /// than `p` bytes, falling back to the other list.
    fn evict_one(&mut self, counters: &Counters) -> Option<u64> {
        let order = if self.arena.bytes(ListId::Mru) > self.p {
            [ListId::Mru, ListId::Mfu]
        } else {
            [ListId::Mfu, ListId::Mru]
        };
        for list in order {
            let victim = self
                .arena
                .iter_from_tail(list)
                .find(|(_, e)| e.evictable())
                .map(|(idx, _)| idx);
            if let Some(idx) = victim {
                return Some(self.demote(idx, list, counters));
            }
        }
        None
    }

    fn demote(&mut self, idx: EntryIdx, list: ListId, counters: &Counters) -> u64 {
        let size = self.arena.size_of(idx).unwrap_or(0);
        if let Some(entry) = self.arena.get_mut(idx) {
            entry.buf = None;
        }
        let ghost = list.ghost();
        self.arena.move_to_head(idx, ghost);
        Counters::bump(match list {
            ListId::Mru => &counters.mru_evictions,
            _ => &counters.mfu_evictions,
        });
        Counters::add(&counters.evicted_bytes, size);
        self.trim_ghost(ghost, counters);
        size
    }

    fn trim_ghost(&mut self, ghost: ListId, counters: &Counters) {
        let limit = self.cfg.ghost_limit();
        while self.arena.len(ghost) > limit {
            let Some(tail) = self.arena.tail(ghost) else {
                break;
            };
            if let Some(entry) = self.arena.remove(tail) {
                self.directory.remove(&entry.key);
            }
            Counters::bump(&counters.ghost_trims);
        }
    }

    /// Buffer of a resident `key`, without counting an access.
    pub(crate) fn resident_buf(&self, key: BlockKey) -> Option<Arc<ArcBuf>> {
        let idx = *self.directory.get(&key)?;
        self.arena.get(idx)?.buf.clone()
    }

    /// Link a new resident entry. Any ghost for `key` is dropped first.
    /// The caller has already made room.
    pub(crate) fn install(
        &mut self,
        key: BlockKey,
        buf: Arc<ArcBuf>,
        list: ListId,
        dirty: bool,
        now: Instant,
    ) {
        self.remove_key(key);
        let idx = self.arena.push_head(
            list,
            key.len_bytes(),
            Entry {
                key,
                buf: Some(buf),
                dirty,
                last_access: now,
            },
        );
        if dirty {
            self.dirty_bytes += key.len_bytes();
        }
        self.directory.insert(key, idx);
    }

    /// Swap the buffer of a resident `key`. Existing handles keep the old
    /// buffer. Returns false when `key` is not resident.
    pub(crate) fn overwrite(&mut self, key: BlockKey, buf: &Arc<ArcBuf>, dirty: bool, now: Instant) -> bool {
        let Some(&idx) = self.directory.get(&key) else {
            return false;
        };
        let Some(list) = self.arena.list_of(idx).filter(|l| !l.is_ghost()) else {
            return false;
        };
        if let Some(entry) = self.arena.get_mut(idx) {
            entry.buf = Some(Arc::clone(buf));
            entry.last_access = now;
        }
        self.set_dirty(idx, dirty);
        self.arena.move_to_head(idx, list);
        true
    }

    /// Clear the dirty flag if the entry still holds `buf`.
    pub(crate) fn mark_clean(&mut self, key: BlockKey, buf: &Arc<ArcBuf>) -> bool {
        let Some(&idx) = self.directory.get(&key) else {
            return false;
        };
        let same = self
            .arena
            .get(idx)
            .and_then(|e| e.buf.as_ref())
            .is_some_and(|b| Arc::ptr_eq(b, buf));
        if same {
            self.set_dirty(idx, false);
        }
        same
    }

    fn set_dirty(&mut self, idx: EntryIdx, dirty: bool) {
        let size = self.arena.size_of(idx).unwrap_or(0);
        let Some(entry) = self.arena.get_mut(idx) else {
            return;
        };
        match (entry.dirty, dirty) {
            (false, true) => self.dirty_bytes += size,
            (true, false) => self.dirty_bytes -= size,
            _ => {}
        }
        entry.dirty = dirty;
    }

    /// Pinned handles to every dirty resident entry, oldest first.
    pub(crate) fn dirty_handles(&self) -> Vec<ArcHandle> {
        [ListId::Mru, ListId::Mfu]
            .into_iter()
            .flat_map(|list| self.arena.iter_from_tail(list))
            .filter(|(_, e)| e.dirty)
            .filter_map(|(_, e)| e.buf.as_ref().map(|b| ArcHandle::pin(e.key, b, true)))
            .collect()
    }

    /// Whether a resident `key` is currently pinned.
    pub(crate) fn is_pinned(&self, key: BlockKey) -> bool {
        self.directory
            .get(&key)
            .and_then(|&idx| self.arena.get(idx))
            .and_then(|e| e.buf.as_ref())
            .is_some_and(|b| b.is_pinned())
    }

    /// Drop `key` from whichever list holds it.
    pub(crate) fn remove_key(&mut self, key: BlockKey) -> bool {
        let Some(idx) = self.directory.remove(&key) else {
            return false;
        };
        let size = self.arena.size_of(idx).unwrap_or(0);
        if let Some(entry) = self.arena.remove(idx) {
            if entry.dirty {
                self.dirty_bytes -= size;
            }
        }
        true
    }

    pub(crate) fn fill_gauges(&self, stats: &mut ArcStats) {
        stats.mru_bytes = self.arena.bytes(ListId::Mru);
        stats.mfu_bytes = self.arena.bytes(ListId::Mfu);
        stats.mru_ghost_bytes = self.arena.bytes(ListId::MruGhost);
        stats.mfu_ghost_bytes = self.arena.bytes(ListId::MfuGhost);
        stats.mru_len = self.arena.len(ListId::Mru);
        stats.mfu_len = self.arena.len(ListId::Mfu);
        stats.mru_ghost_len = self.arena.len(ListId::MruGhost);
        stats.mfu_ghost_len = self.arena.len(ListId::MfuGhost);
        stats.dirty_bytes = self.dirty_bytes;
        stats.p = self.p;
        stats.c = self.c;
        stats.c_min = self.cfg.c_min;
        stats.c_max = self.cfg.c_max;
        stats.config_version = self.config_version;
    }
}
