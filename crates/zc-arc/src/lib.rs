#![forbid(unsafe_code)]
//! Adaptive replacement cache for pool blocks.
//!
//! Resident blocks sit in one of two lists: MRU (seen once recently) and
//! MFU (seen repeatedly). Evicted blocks leave a ghost (key and size only)
//! in a matching ghost list. A miss that hits a ghost is evidence the
//! corresponding list was too small, so the adaptation target `p` (bytes
//! of MRU to keep) moves toward it:
//!
//! - MRU-ghost hit: `p += size * max(1, mfu_ghost_bytes / mru_ghost_bytes)`
//! - MFU-ghost hit: `p -= size * max(1, mru_ghost_bytes / mfu_ghost_bytes)`
//!
//! with `p` kept within `[c >> p_min_shift, c - (c >> p_min_shift)]`. Eviction takes the LRU evictable
//! entry from MRU while MRU holds more than `p` bytes, otherwise from MFU.
//! Pinned and dirty entries are never evicted.
//!
//! Separately from the hard ceiling `c_max`, the cache keeps a soft target
//! `c` in `[c_min, c_max]` that memory pressure shrinks and misses grow
//! back; [`ArcCache::reclaim`] evicts toward it.
//!
//! Configuration is read from a versioned [`ConfigCell`](zc_types::ConfigCell).
//! Each operation adopts the newest version first, so lowering `c_max`
//! evicts down to it on the next call.

use asupersync::Cx;
use zc_error::{Result, ZcError};

pub mod buf;
pub mod cache;
pub mod config;
mod list;
pub mod source;
mod state;
pub mod stats;

pub use buf::{ArcBuf, ArcHandle};
pub use cache::{ArcCache, FetchCallback, ReclaimOutcome};
pub use config::{AdmissionPolicy, ArcConfig};
pub use list::ListId;
pub use source::{BlockSource, ReadCallback, VdevSource};
pub use state::MemoryPressure;
pub use stats::ArcStats;

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ZcError::Cancelled)
}
