//! Shared block buffers and the pinning handles that guard them.
//!
//! A cached block's bytes live in an [`ArcBuf`] shared by the cache entry
//! and every outstanding [`ArcHandle`]. Each handle holds one pin; the
//! cache never evicts an entry whose buffer is pinned.
//!
//! New handles for a cached entry are only minted while the cache's list
//! lock is held, so a pin count can go from zero to one only under that
//! lock. Cloning an existing handle raises a count that is already
//! non-zero and needs no lock.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use zc_types::BlockKey;

/// Block data plus its pin count.
pub struct ArcBuf {
    data: Box<[u8]>,
    pins: AtomicU32,
}

impl ArcBuf {
    pub(crate) fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: data.into_boxed_slice(),
            pins: AtomicU32::new(0),
        })
    }

    /// Current number of pins.
    #[must_use]
    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pins() > 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for ArcBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcBuf")
            .field("len", &self.data.len())
            .field("pins", &self.pins())
            .finish()
    }
}

/// A pinned reference to cached block data.
///
/// Dropping the handle releases its pin. The bytes never change under a
/// handle: overwriting a block gives the cache entry a fresh buffer while
/// existing handles keep the old one.
pub struct ArcHandle {
    key: BlockKey,
    buf: Arc<ArcBuf>,
    cached: bool,
}

impl ArcHandle {
    /// Pin `buf`. Callers hold the cache list lock when `buf` belongs to a
    /// live cache entry.
    pub(crate) fn pin(key: BlockKey, buf: &Arc<ArcBuf>, cached: bool) -> Self {
        buf.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            key,
            buf: Arc::clone(buf),
            cached,
        }
    }

    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.as_slice().to_vec()
    }

    /// False when the data was handed over without being admitted into the
    /// cache (no room at fill time).
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Whether both handles refer to the same buffer.
    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    pub(crate) fn buf(&self) -> &Arc<ArcBuf> {
        &self.buf
    }
}

impl Clone for ArcHandle {
    fn clone(&self) -> Self {
        Self::pin(self.key, &self.buf, self.cached)
    }
}

impl Drop for ArcHandle {
    fn drop(&mut self) {
        self.buf.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Deref for ArcHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ArcHandle {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ArcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcHandle")
            .field("key", &self.key)
            .field("cached", &self.cached)
            .field("pins", &self.buf.pins())
            .finish()
    }
}
