#![forbid(unsafe_code)]
//! Error types for the pool core.
//!
//! # Error Taxonomy
//!
//! | Class | Variant(s) | Recoverable | Who handles it |
//! |-------|------------|-------------|----------------|
//! | Device I/O failure | `DeviceIo` | transient or permanent | caller (pool layer may retry on a mirror) |
//! | Device removed | `DeviceGone` | no (for that device) | caller |
//! | Cache exhausted | `OutOfCacheSpace` | yes, after eviction | cache internally; surfaces only when every victim is pinned or dirty |
//! | Broken invariant | `InvariantViolation`, `Halted` | no | halts the affected subsystem |
//! | Pool shutting down | `PoolShutdown` | no | writers fail fast |
//! | Configuration | `UnknownTunable`, `InvalidTunable`, `InvalidArgument` | yes | caller fixes input |
//!
//! The cache and scheduler never retry device errors themselves; they
//! deliver them to the original completion callback.
//!
//! `ZcError` is `Clone` because one device failure can complete several
//! requests at once (aggregated I/O, coalesced cache misses).
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`ZcError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `DeviceIo` | carried errno, else `EIO` |
//! | `DeviceGone` | `ENXIO` |
//! | `UnknownDevice` | `ENODEV` |
//! | `UnknownPool` | `ENOENT` |
//! | `OutOfCacheSpace` | `ENOMEM` |
//! | `InvariantViolation` | `EIO` |
//! | `Halted` | `EIO` |
//! | `PoolShutdown` | `ESHUTDOWN` |
//! | `UnknownTunable` | `ENOENT` |
//! | `InvalidTunable` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `Cancelled` | `EINTR` |

use thiserror::Error;

/// Unified error type for cache, scheduler, throttle, and tunable operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZcError {
    /// A device operation failed.
    ///
    /// `transient` distinguishes errors worth retrying (timeouts, busy
    /// media) from permanent media or addressing failures.
    #[error("device {vdev} I/O error at offset {offset}: {detail}")]
    DeviceIo {
        vdev: u32,
        offset: u64,
        errno: Option<i32>,
        transient: bool,
        detail: String,
    },

    /// The device was removed; pending and in-flight requests are cancelled.
    #[error("device {vdev} is gone")]
    DeviceGone { vdev: u32 },

    /// No device with this id is attached.
    #[error("unknown device {0}")]
    UnknownDevice(u32),

    /// No pool with this id is registered.
    #[error("unknown pool {0}")]
    UnknownPool(u64),

    /// The cache could not make room: every candidate victim is pinned or dirty.
    #[error("out of cache space: need {requested} bytes ({detail})")]
    OutOfCacheSpace { requested: u64, detail: String },

    /// An internal invariant was broken. The subsystem that detected it halts.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The subsystem halted after an earlier invariant violation.
    #[error("{subsystem} halted after an invariant violation")]
    Halted { subsystem: &'static str },

    /// The pool is shutting down; pending writers are failed.
    #[error("pool {pool} is shutting down")]
    PoolShutdown { pool: u64 },

    /// Tunable name not present in the table.
    #[error("unknown tunable: {0}")]
    UnknownTunable(String),

    /// Tunable value rejected (wrong kind, out of range, inconsistent).
    #[error("invalid value for tunable {name}: {reason}")]
    InvalidTunable { name: String, reason: String },

    /// Caller passed an argument that can never succeed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was abandoned before completing.
    #[error("operation cancelled")]
    Cancelled,
}

impl ZcError {
    /// Build a `DeviceIo` error from an OS error, keeping its errno.
    #[must_use]
    pub fn device_io(vdev: u32, offset: u64, err: &std::io::Error) -> Self {
        let transient = matches!(
            err.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        );
        Self::DeviceIo {
            vdev,
            offset,
            errno: err.raw_os_error(),
            transient,
            detail: err.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DeviceIo { transient, .. } => *transient,
            Self::OutOfCacheSpace { .. } => true,
            _ => false,
        }
    }

    /// Whether the error stopped a subsystem for good.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::Halted { .. })
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::DeviceIo { errno, .. } => errno.unwrap_or(libc::EIO),
            Self::DeviceGone { .. } => libc::ENXIO,
            Self::UnknownDevice(_) => libc::ENODEV,
            Self::UnknownPool(_) | Self::UnknownTunable(_) => libc::ENOENT,
            Self::OutOfCacheSpace { .. } => libc::ENOMEM,
            Self::InvariantViolation(_) | Self::Halted { .. } => libc::EIO,
            Self::PoolShutdown { .. } => libc::ESHUTDOWN,
            Self::InvalidTunable { .. } | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Cancelled => libc::EINTR,
        }
    }
}

/// Result alias using `ZcError`.
pub type Result<T> = std::result::Result<T, ZcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(ZcError, libc::c_int)> = vec![
            (
                ZcError::DeviceIo {
                    vdev: 0,
                    offset: 0,
                    errno: None,
                    transient: false,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (ZcError::DeviceGone { vdev: 1 }, libc::ENXIO),
            (ZcError::UnknownDevice(9), libc::ENODEV),
            (ZcError::UnknownPool(9), libc::ENOENT),
            (
                ZcError::OutOfCacheSpace {
                    requested: 10,
                    detail: "all pinned".into(),
                },
                libc::ENOMEM,
            ),
            (ZcError::InvariantViolation("x".into()), libc::EIO),
            (ZcError::Halted { subsystem: "arc" }, libc::EIO),
            (ZcError::PoolShutdown { pool: 1 }, libc::ESHUTDOWN),
            (ZcError::UnknownTunable("nope".into()), libc::ENOENT),
            (
                ZcError::InvalidTunable {
                    name: "zfs_arc_max".into(),
                    reason: "zero".into(),
                },
                libc::EINVAL,
            ),
            (ZcError::InvalidArgument("size".into()), libc::EINVAL),
            (ZcError::Cancelled, libc::EINTR),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(error.to_errno(), *expected_errno, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn device_io_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = ZcError::device_io(2, 4096, &raw);
        assert_eq!(err.to_errno(), libc::EPERM);
        assert!(!err.is_transient());
    }

    #[test]
    fn timeouts_are_transient() {
        let raw = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(ZcError::device_io(0, 0, &raw).is_transient());
        assert!(ZcError::OutOfCacheSpace {
            requested: 1,
            detail: String::new()
        }
        .is_transient());
        assert!(!ZcError::DeviceGone { vdev: 0 }.is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(ZcError::InvariantViolation("negative dirty".into()).is_fatal());
        assert!(ZcError::Halted { subsystem: "throttle" }.is_fatal());
        assert!(!ZcError::Cancelled.is_fatal());
    }

    #[test]
    fn display_formatting() {
        let err = ZcError::DeviceIo {
            vdev: 3,
            offset: 8192,
            errno: Some(libc::EIO),
            transient: false,
            detail: "medium error".into(),
        };
        assert_eq!(
            err.to_string(),
            "device 3 I/O error at offset 8192: medium error"
        );
        assert_eq!(ZcError::DeviceGone { vdev: 4 }.to_string(), "device 4 is gone");
        assert_eq!(
            ZcError::Halted { subsystem: "arc" }.to_string(),
            "arc halted after an invariant violation"
        );
    }
}
