#![forbid(unsafe_code)]
//! Named key/value access to the live cache, scheduler, and throttle
//! configuration.
//!
//! Each key is declared unsigned or signed 64-bit. Reads come from the
//! current configuration versions; writes stage a whole batch, validate it,
//! and publish new versions only for the components whose values changed.

pub mod table;
pub mod value;

pub use table::{ApplyReport, Component, TunableInfo, TunableSnapshot, TunableTable};
pub use value::{TunableKind, TunableValue};
