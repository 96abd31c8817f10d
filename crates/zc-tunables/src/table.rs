//! The named tunable table.
//!
//! # Logging
//!
//! - **DEBUG** `zc::tunables`: `tunable_set`: one key changed within an applied batch
//! - **INFO**  `zc::tunables`: `tunables_applied`: a batch was published
//! - **WARN**  `zc::tunables`: `tunables_rejected`: a batch was refused; nothing changed

use crate::value::{TunableKind, TunableValue, fit_u32};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zc_arc::ArcConfig;
use zc_error::{Result, ZcError};
use zc_throttle::ThrottleConfig;
use zc_types::{ConfigCell, IoPriority};
use zc_vdev::{VdevQueueConfig, VdevSet};

/// Configuration a tunable belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Arc,
    Vdev,
    Throttle,
}

#[derive(Debug, Clone, Copy)]
enum Key {
    ArcMax,
    ArcMin,
    ArcGrowRetry,
    ArcShrinkShift,
    ArcPMinShift,
    ArcAverageBlocksize,
    MaxActive,
    ClassMin(IoPriority),
    ClassMax(IoPriority),
    AsyncWriteMinDirtyPct,
    AsyncWriteMaxDirtyPct,
    AggregationLimit,
    ReadGapLimit,
    WriteGapLimit,
    DirtyDataMax,
    DirtyDataSync,
    DelayMaxNs,
    DelayMinDirtyPercent,
    DelayScale,
}

const KEYS: [(&str, Key); 27] = [
    ("zfs_arc_max", Key::ArcMax),
    ("zfs_arc_min", Key::ArcMin),
    ("zfs_arc_grow_retry", Key::ArcGrowRetry),
    ("zfs_arc_shrink_shift", Key::ArcShrinkShift),
    ("zfs_arc_p_min_shift", Key::ArcPMinShift),
    ("zfs_arc_average_blocksize", Key::ArcAverageBlocksize),
    ("max_active", Key::MaxActive),
    ("sync_read_min_active", Key::ClassMin(IoPriority::SyncRead)),
    ("sync_read_max_active", Key::ClassMax(IoPriority::SyncRead)),
    ("sync_write_min_active", Key::ClassMin(IoPriority::SyncWrite)),
    ("sync_write_max_active", Key::ClassMax(IoPriority::SyncWrite)),
    ("async_read_min_active", Key::ClassMin(IoPriority::AsyncRead)),
    ("async_read_max_active", Key::ClassMax(IoPriority::AsyncRead)),
    ("async_write_min_active", Key::ClassMin(IoPriority::AsyncWrite)),
    ("async_write_max_active", Key::ClassMax(IoPriority::AsyncWrite)),
    ("scrub_min_active", Key::ClassMin(IoPriority::Scrub)),
    ("scrub_max_active", Key::ClassMax(IoPriority::Scrub)),
    ("async_write_min_dirty_pct", Key::AsyncWriteMinDirtyPct),
    ("async_write_max_dirty_pct", Key::AsyncWriteMaxDirtyPct),
    ("aggregation_limit", Key::AggregationLimit),
    ("read_gap_limit", Key::ReadGapLimit),
    ("write_gap_limit", Key::WriteGapLimit),
    ("zfs_dirty_data_max", Key::DirtyDataMax),
    ("zfs_dirty_data_sync", Key::DirtyDataSync),
    ("zfs_delay_max_ns", Key::DelayMaxNs),
    ("zfs_delay_min_dirty_percent", Key::DelayMinDirtyPercent),
    ("zfs_delay_scale", Key::DelayScale),
];

/// Working copy of all three configurations while a batch is applied.
#[derive(Clone, PartialEq)]
struct Configs {
    arc: ArcConfig,
    vdev: VdevQueueConfig,
    throttle: ThrottleConfig,
}

impl Key {
    fn lookup(name: &str) -> Option<(&'static str, Self)> {
        KEYS.iter().find(|(n, _)| *n == name).copied()
    }

    fn component(self) -> Component {
        match self {
            Self::ArcMax
            | Self::ArcMin
            | Self::ArcGrowRetry
            | Self::ArcShrinkShift
            | Self::ArcPMinShift
            | Self::ArcAverageBlocksize => Component::Arc,
            Self::DirtyDataMax
            | Self::DirtyDataSync
            | Self::DelayMaxNs
            | Self::DelayMinDirtyPercent
            | Self::DelayScale => Component::Throttle,
            _ => Component::Vdev,
        }
    }

    fn kind(self) -> TunableKind {
        match self {
            Self::ArcMax
            | Self::ArcMin
            | Self::ArcGrowRetry
            | Self::ArcShrinkShift
            | Self::ArcPMinShift
            | Self::ArcAverageBlocksize
            | Self::MaxActive
            | Self::ClassMin(_)
            | Self::ClassMax(_) => TunableKind::Unsigned,
            _ => TunableKind::Signed,
        }
    }

    fn get(self, c: &Configs) -> TunableValue {
        let u = TunableValue::Unsigned;
        let s = TunableValue::signed_from;
        match self {
            Self::ArcMax => u(c.arc.c_max),
            Self::ArcMin => u(c.arc.c_min),
            Self::ArcGrowRetry => u(c.arc.grow_retry.as_secs()),
            Self::ArcShrinkShift => u(u64::from(c.arc.shrink_shift)),
            Self::ArcPMinShift => u(u64::from(c.arc.p_min_shift)),
            Self::ArcAverageBlocksize => u(c.arc.average_block_size),
            Self::MaxActive => u(u64::from(c.vdev.max_active)),
            Self::ClassMin(p) => u(u64::from(c.vdev.limits(p).min_active)),
            Self::ClassMax(p) => u(u64::from(c.vdev.limits(p).max_active)),
            Self::AsyncWriteMinDirtyPct => s(u64::from(c.vdev.async_write_min_dirty_pct)),
            Self::AsyncWriteMaxDirtyPct => s(u64::from(c.vdev.async_write_max_dirty_pct)),
            Self::AggregationLimit => s(u64::from(c.vdev.aggregation_limit)),
            Self::ReadGapLimit => s(u64::from(c.vdev.read_gap_limit)),
            Self::WriteGapLimit => s(u64::from(c.vdev.write_gap_limit)),
            Self::DirtyDataMax => s(c.throttle.dirty_data_max),
            Self::DirtyDataSync => s(c.throttle.dirty_data_sync),
            Self::DelayMaxNs => s(u64::try_from(c.throttle.delay_max.as_nanos()).unwrap_or(u64::MAX)),
            Self::DelayMinDirtyPercent => s(u64::from(c.throttle.delay_min_dirty_percent)),
            Self::DelayScale => s(c.throttle.delay_scale),
        }
    }

    fn set(self, name: &str, value: TunableValue, c: &mut Configs) -> Result<()> {
        let v = value.expect_magnitude(name, self.kind())?;
        match self {
            Self::ArcMax => c.arc.c_max = v,
            Self::ArcMin => c.arc.c_min = v,
            Self::ArcGrowRetry => c.arc.grow_retry = Duration::from_secs(v),
            Self::ArcShrinkShift => c.arc.shrink_shift = fit_u32(name, v)?,
            Self::ArcPMinShift => c.arc.p_min_shift = fit_u32(name, v)?,
            Self::ArcAverageBlocksize => c.arc.average_block_size = v,
            Self::MaxActive => c.vdev.max_active = fit_u32(name, v)?,
            Self::ClassMin(p) => c.vdev.limits_mut(p).min_active = fit_u32(name, v)?,
            Self::ClassMax(p) => c.vdev.limits_mut(p).max_active = fit_u32(name, v)?,
            Self::AsyncWriteMinDirtyPct => c.vdev.async_write_min_dirty_pct = fit_u32(name, v)?,
            Self::AsyncWriteMaxDirtyPct => c.vdev.async_write_max_dirty_pct = fit_u32(name, v)?,
            Self::AggregationLimit => c.vdev.aggregation_limit = fit_u32(name, v)?,
            Self::ReadGapLimit => c.vdev.read_gap_limit = fit_u32(name, v)?,
            Self::WriteGapLimit => c.vdev.write_gap_limit = fit_u32(name, v)?,
            Self::DirtyDataMax => c.throttle.dirty_data_max = v,
            Self::DirtyDataSync => c.throttle.dirty_data_sync = v,
            Self::DelayMaxNs => c.throttle.delay_max = Duration::from_nanos(v),
            Self::DelayMinDirtyPercent => c.throttle.delay_min_dirty_percent = fit_u32(name, v)?,
            Self::DelayScale => c.throttle.delay_scale = v,
        }
        Ok(())
    }
}

/// Declaration of one tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TunableInfo {
    pub name: &'static str,
    pub kind: TunableKind,
    pub component: Component,
}

/// Every tunable with its current value, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunableSnapshot {
    pub arc_version: u64,
    pub vdev_version: u64,
    pub throttle_version: u64,
    pub values: BTreeMap<&'static str, TunableValue>,
}

/// What an applied batch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Keys whose value differs from before the batch.
    pub changed: Vec<&'static str>,
    /// Components that published a new configuration version.
    pub published: Vec<Component>,
}

/// Read/write bridge from tunable names to live component configuration.
///
/// A batch is applied all-or-nothing: every key is resolved, kind-checked,
/// range-checked, and the resulting configurations validated before any of
/// them is published. Operations already running keep the snapshot they
/// started with.
pub struct TunableTable {
    arc: Arc<ConfigCell<ArcConfig>>,
    vdev: Arc<ConfigCell<VdevQueueConfig>>,
    throttle: Arc<ConfigCell<ThrottleConfig>>,
    vdevs: Option<Arc<VdevSet>>,
    apply_lock: Mutex<()>,
}

impl fmt::Debug for TunableTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunableTable")
            .field("arc_version", &self.arc.version())
            .field("vdev_version", &self.vdev.version())
            .field("throttle_version", &self.throttle.version())
            .finish_non_exhaustive()
    }
}

impl TunableTable {
    #[must_use]
    pub fn new(
        arc: Arc<ConfigCell<ArcConfig>>,
        vdev: Arc<ConfigCell<VdevQueueConfig>>,
        throttle: Arc<ConfigCell<ThrottleConfig>>,
    ) -> Self {
        Self {
            arc,
            vdev,
            throttle,
            vdevs: None,
            apply_lock: Mutex::new(()),
        }
    }

    /// Reschedule these queues after queue tunables change, so raised
    /// limits take effect without waiting for the next completion.
    #[must_use]
    pub fn with_vdevs(mut self, vdevs: Arc<VdevSet>) -> Self {
        self.vdevs = Some(vdevs);
        self
    }

    /// Every declared tunable, in table order.
    #[must_use]
    pub fn keys() -> Vec<TunableInfo> {
        KEYS.iter()
            .map(|&(name, key)| TunableInfo {
                name,
                kind: key.kind(),
                component: key.component(),
            })
            .collect()
    }

    fn current(&self) -> Configs {
        Configs {
            arc: self.arc.current(),
            vdev: self.vdev.current(),
            throttle: self.throttle.current(),
        }
    }

    pub fn get(&self, name: &str) -> Result<TunableValue> {
        let (_, key) = Key::lookup(name).ok_or_else(|| ZcError::UnknownTunable(name.to_owned()))?;
        Ok(key.get(&self.current()))
    }

    /// Bulk read of every tunable.
    #[must_use]
    pub fn snapshot(&self) -> TunableSnapshot {
        let arc = self.arc.load();
        let vdev = self.vdev.load();
        let throttle = self.throttle.load();
        let configs = Configs {
            arc: arc.value.clone(),
            vdev: vdev.value.clone(),
            throttle: throttle.value.clone(),
        };
        TunableSnapshot {
            arc_version: arc.version,
            vdev_version: vdev.version,
            throttle_version: throttle.version,
            values: KEYS
                .iter()
                .map(|&(name, key)| (name, key.get(&configs)))
                .collect(),
        }
    }

    pub fn set(&self, name: &str, value: TunableValue) -> Result<ApplyReport> {
        self.apply(&[(name, value)])
    }

    /// Bulk write. Either every entry takes effect or none does.
    pub fn apply<S: AsRef<str>>(&self, batch: &[(S, TunableValue)]) -> Result<ApplyReport> {
        let _serialized = self.apply_lock.lock();
        let before = self.current();
        let after = match Self::stage(&before, batch) {
            Ok(after) => after,
            Err(err) => {
                warn!(target: "zc::tunables", entries = batch.len(), error = %err, "tunables_rejected");
                return Err(err);
            }
        };

        let mut report = ApplyReport::default();
        for &(name, key) in &KEYS {
            let (old, new) = (key.get(&before), key.get(&after));
            if old != new {
                debug!(target: "zc::tunables", key = name, old = %old, new = %new, "tunable_set");
                report.changed.push(name);
            }
        }
        if after.arc != before.arc {
            self.arc.publish(after.arc);
            report.published.push(Component::Arc);
        }
        if after.vdev != before.vdev {
            self.vdev.publish(after.vdev);
            report.published.push(Component::Vdev);
            if let Some(vdevs) = &self.vdevs {
                vdevs.reschedule_all();
            }
        }
        if after.throttle != before.throttle {
            self.throttle.publish(after.throttle);
            report.published.push(Component::Throttle);
        }
        info!(
            target: "zc::tunables",
            entries = batch.len(),
            changed = report.changed.len(),
            published = report.published.len(),
            "tunables_applied"
        );
        Ok(report)
    }

    fn stage<S: AsRef<str>>(before: &Configs, batch: &[(S, TunableValue)]) -> Result<Configs> {
        let mut staged = before.clone();
        for (name, value) in batch {
            let name = name.as_ref();
            let (name, key) =
                Key::lookup(name).ok_or_else(|| ZcError::UnknownTunable(name.to_owned()))?;
            key.set(name, *value, &mut staged)?;
        }
        staged.arc.validate()?;
        staged.vdev.validate()?;
        staged.throttle.validate()?;
        Ok(staged)
    }
}
