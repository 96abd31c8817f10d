//! Typed tunable values.

use serde::{Deserialize, Serialize};
use std::fmt;
use zc_error::{Result, ZcError};

/// Integer kind a tunable is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunableKind {
    Unsigned,
    Signed,
}

/// A tunable value tagged with its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TunableValue {
    Unsigned(u64),
    Signed(i64),
}

impl TunableValue {
    #[must_use]
    pub fn kind(self) -> TunableKind {
        match self {
            Self::Unsigned(_) => TunableKind::Unsigned,
            Self::Signed(_) => TunableKind::Signed,
        }
    }

    /// Signed view of a stored magnitude, saturating at `i64::MAX`.
    pub(crate) fn signed_from(v: u64) -> Self {
        Self::Signed(i64::try_from(v).unwrap_or(i64::MAX))
    }

    /// Magnitude of a value that must have `kind` and be non-negative.
    pub(crate) fn expect_magnitude(self, name: &str, kind: TunableKind) -> Result<u64> {
        match (self, kind) {
            (Self::Unsigned(v), TunableKind::Unsigned) => Ok(v),
            (Self::Signed(v), TunableKind::Signed) => u64::try_from(v)
                .map_err(|_| invalid(name, &format!("{v} is negative"))),
            _ => Err(invalid(
                name,
                &format!("expected a {kind} value, got {}", self.kind()),
            )),
        }
    }
}

impl fmt::Display for TunableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsigned => "unsigned",
            Self::Signed => "signed",
        })
    }
}

impl fmt::Display for TunableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Signed(v) => write!(f, "{v}"),
        }
    }
}

pub(crate) fn invalid(name: &str, reason: &str) -> ZcError {
    ZcError::InvalidTunable {
        name: name.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Narrow a magnitude to `u32`, rejecting values that do not fit.
pub(crate) fn fit_u32(name: &str, v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| invalid(name, &format!("{v} exceeds {}", u32::MAX)))
}
