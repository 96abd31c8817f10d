//! Routing of requests to per-device queues.

use crate::config::VdevQueueConfig;
use crate::engine::DeviceBackend;
use crate::queue::{IoRequest, QueueSnapshot, VdevQueue};
use asupersync::Cx;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use zc_error::{Result, ZcError};
use zc_types::{ConfigCell, DirtyGauge, VdevId};

/// All device queues of one pool, sharing one configuration cell.
///
/// Removed devices stay registered so that late submissions fail with
/// `DeviceGone` rather than `UnknownDevice`.
pub struct VdevSet {
    config: Arc<ConfigCell<VdevQueueConfig>>,
    gauge: Option<Arc<dyn DirtyGauge>>,
    queues: RwLock<BTreeMap<VdevId, Arc<VdevQueue>>>,
}

impl std::fmt::Debug for VdevSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdevSet")
            .field("devices", &self.ids())
            .field("config_version", &self.config.version())
            .finish_non_exhaustive()
    }
}

impl VdevSet {
    #[must_use]
    pub fn new(
        config: Arc<ConfigCell<VdevQueueConfig>>,
        gauge: Option<Arc<dyn DirtyGauge>>,
    ) -> Self {
        Self {
            config,
            gauge,
            queues: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigCell<VdevQueueConfig>> {
        &self.config
    }

    /// Attach a device. Ids are never reused, even after removal.
    pub fn attach(&self, vdev: VdevId, backend: Arc<dyn DeviceBackend>) -> Result<Arc<VdevQueue>> {
        let mut queues = self.queues.write();
        if queues.contains_key(&vdev) {
            return Err(ZcError::InvalidArgument(format!(
                "device {} already attached",
                vdev.0
            )));
        }
        let queue = VdevQueue::new(vdev, backend, Arc::clone(&self.config), self.gauge.clone());
        queues.insert(vdev, Arc::clone(&queue));
        info!(
            target: "zc::vdev::queue",
            vdev = vdev.0,
            devices = queues.len(),
            "vdev_attach"
        );
        Ok(queue)
    }

    pub fn get(&self, vdev: VdevId) -> Result<Arc<VdevQueue>> {
        self.queues
            .read()
            .get(&vdev)
            .cloned()
            .ok_or(ZcError::UnknownDevice(vdev.0))
    }

    pub fn submit(&self, cx: &Cx, vdev: VdevId, request: IoRequest) -> Result<()> {
        self.get(vdev)?.submit(cx, request)
    }

    /// Cancel everything outstanding on `vdev` and refuse further work.
    pub fn remove(&self, vdev: VdevId) -> Result<usize> {
        Ok(self.get(vdev)?.remove())
    }

    #[must_use]
    pub fn ids(&self) -> Vec<VdevId> {
        self.queues.read().keys().copied().collect()
    }

    /// Let every queue pick up a newly published configuration.
    pub fn reschedule_all(&self) {
        let queues: Vec<_> = self.queues.read().values().cloned().collect();
        for queue in queues {
            queue.reschedule();
        }
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        self.queues.read().values().map(|q| q.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemDevice;
    use zc_types::IoPriority;

    fn set_with(ids: &[u32]) -> VdevSet {
        let set = VdevSet::new(
            Arc::new(ConfigCell::new("vdev", VdevQueueConfig::default())),
            None,
        );
        for &id in ids {
            set.attach(VdevId(id), Arc::new(MemDevice::new(VdevId(id), 64 * 1024)))
                .expect("attach");
        }
        set
    }

    #[test]
    fn routes_by_device_id() {
        let set = set_with(&[0, 1]);
        set.get(VdevId(1))
            .expect("vdev 1")
            .write_blocking(&Cx::for_testing(), 0, vec![1; 512], IoPriority::SyncWrite)
            .expect("write");
        let snaps = set.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].stats.submitted, 0);
        assert_eq!(snaps[1].stats.submitted, 1);
    }

    #[test]
    fn unknown_and_duplicate_devices() {
        let set = set_with(&[0]);
        assert_eq!(
            set.get(VdevId(9)).expect_err("unknown"),
            ZcError::UnknownDevice(9)
        );
        let dup = set.attach(VdevId(0), Arc::new(MemDevice::new(VdevId(0), 512)));
        assert!(matches!(dup, Err(ZcError::InvalidArgument(_))));
    }

    #[test]
    fn removed_device_stays_known() {
        let set = set_with(&[3]);
        assert_eq!(set.remove(VdevId(3)).expect("remove"), 0);
        let err = set
            .submit(
                &Cx::for_testing(),
                VdevId(3),
                IoRequest::read(0, 512, IoPriority::SyncRead, |_| {}),
            )
            .expect_err("gone");
        assert_eq!(err, ZcError::DeviceGone { vdev: 3 });
        assert_eq!(set.ids(), vec![VdevId(3)]);
    }
}
