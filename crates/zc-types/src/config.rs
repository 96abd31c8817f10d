//! Versioned, RCU-published configuration cells.
//!
//! Each component keeps its live tunables in a [`ConfigCell`]. Operations
//! take one lock-free snapshot at their start and use it throughout, so a
//! concurrent tunable update only affects operations that begin after it is
//! published.
//!
//! # Logging
//!
//! - **DEBUG** `zc::config`: `config_publish`: a new version was published

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A configuration value tagged with the version it was published under.
///
/// Version 0 is the value the cell was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// A single RCU-protected configuration value.
///
/// Readers never block; writers replace the whole value and bump the
/// version. Old snapshots stay valid for as long as a reader holds them.
pub struct ConfigCell<T> {
    name: &'static str,
    inner: ArcSwap<Versioned<T>>,
}

impl<T: fmt::Debug> fmt::Debug for ConfigCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigCell")
            .field("name", &self.name)
            .field("current", &*self.inner.load_full())
            .finish()
    }
}

impl<T> ConfigCell<T> {
    /// Create a cell holding `value` at version 0.
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: ArcSwap::from_pointee(Versioned { version: 0, value }),
        }
    }

    /// Component name, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Snapshot the current value. Holding the returned `Arc` pins that
    /// version; it is never mutated in place.
    #[inline]
    #[must_use]
    pub fn load(&self) -> Arc<Versioned<T>> {
        self.inner.load_full()
    }

    /// Version currently published.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.load().version
    }
}

impl<T: Clone> ConfigCell<T> {
    /// Publish `value` as the next version and return that version.
    pub fn publish(&self, value: T) -> u64 {
        let previous = self.inner.rcu(|current| Versioned {
            version: current.version + 1,
            value: value.clone(),
        });
        let version = previous.version + 1;
        debug!(
            target: "zc::config",
            cell = self.name,
            version,
            "config_publish"
        );
        version
    }

    /// Clone of the current value without its version tag.
    #[must_use]
    pub fn current(&self) -> T {
        self.inner.load().value.clone()
    }
}
