#![forbid(unsafe_code)]
//! Shared vocabulary for the cache, device scheduler, and write throttle.
//!
//! Everything here is plain data: addresses, identifiers, I/O classes, and
//! the versioned configuration cell that every component reads its live
//! tunables from.

pub mod config;

pub use config::{ConfigCell, Versioned};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a leaf or virtual device within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VdevId(pub u32);

/// Identifier of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u64);

/// Byte offset on a device.
///
/// Unit-carrying wrapper so offsets and lengths are not mixed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Pool-unique address of a cached block: device, offset, and size.
///
/// Two keys with the same offset but different sizes name different
/// blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub vdev: VdevId,
    pub offset: ByteOffset,
    pub size: u32,
}

impl BlockKey {
    #[must_use]
    pub const fn new(vdev: VdevId, offset: u64, size: u32) -> Self {
        Self {
            vdev,
            offset: ByteOffset(offset),
            size,
        }
    }

    /// First byte past the block. Saturates instead of wrapping.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.0.saturating_add(u64::from(self.size))
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        u64::from(self.size)
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.vdev.0, self.offset, self.size)
    }
}

/// Direction of a device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoKind {
    Read,
    Write,
}

/// Scheduling class of a queued I/O.
///
/// Declaration order is the service precedence: synchronous before
/// asynchronous, reads before writes within a tier, scrub last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IoPriority {
    SyncRead,
    SyncWrite,
    AsyncRead,
    AsyncWrite,
    Scrub,
}

impl IoPriority {
    /// Number of queueable classes.
    pub const COUNT: usize = 5;

    /// All classes in service precedence order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::SyncRead,
        Self::SyncWrite,
        Self::AsyncRead,
        Self::AsyncWrite,
        Self::Scrub,
    ];

    /// Dense index in `0..COUNT`, matching [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::SyncRead => 0,
            Self::SyncWrite => 1,
            Self::AsyncRead => 2,
            Self::AsyncWrite => 3,
            Self::Scrub => 4,
        }
    }

    /// The device direction this class carries.
    #[must_use]
    pub const fn kind(self) -> IoKind {
        match self {
            Self::SyncRead | Self::AsyncRead | Self::Scrub => IoKind::Read,
            Self::SyncWrite | Self::AsyncWrite => IoKind::Write,
        }
    }

    /// Short stable name used in logs and tunable keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncRead => "sync_read",
            Self::SyncWrite => "sync_write",
            Self::AsyncRead => "async_read",
            Self::AsyncWrite => "async_write",
            Self::Scrub => "scrub",
        }
    }
}

impl fmt::Display for IoPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a pool's outstanding dirty data.
///
/// The device scheduler consults this to widen async write concurrency as
/// dirty data builds up; the write throttle implements it.
pub trait DirtyGauge: Send + Sync {
    /// Bytes written but not yet durably committed.
    fn dirty_bytes(&self) -> u64;

    /// Configured dirty-data ceiling for the pool.
    fn dirty_max(&self) -> u64;
}
