use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::config::{
    DEFAULT_MONITOR_RESYNC_PERIOD, HOST_PATH_NOT_EXIST, MIS_MATCHED_VOL_SIZE, NOT_MOUNT_POINT,
};
use crate::mark::VolumeMarker;
use crate::monitor_config::MountConfig;
use crate::node_affinity::check_node_affinity;
use crate::quantity_parser::QuantityParser;
use crate::volume_map::VolumeMap;
use crate::volume_util::{round_down_capacity_pretty, Mounter, VolumeUtil};
use crate::watch::StopSignal;

/// Node-scoped health evaluator for local PVs.
///
/// Walks the volume cache every monitor period and, for each local PV bound
/// to this node by affinity, verifies the backing path, the mount point and
/// the size contract, asking the mark engine to record any violation.
pub struct LocalPVMonitor {
    node: Node,
    discovery_map: HashMap<String, MountConfig>,
    volume_map: Arc<VolumeMap>,
    marker: Arc<dyn VolumeMarker>,
    volume_util: Arc<dyn VolumeUtil>,
    mounter: Arc<dyn Mounter>,
}

impl LocalPVMonitor {
    pub fn new(
        node: Node,
        discovery_map: HashMap<String, MountConfig>,
        volume_map: Arc<VolumeMap>,
        marker: Arc<dyn VolumeMarker>,
        volume_util: Arc<dyn VolumeUtil>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        LocalPVMonitor { node, discovery_map, volume_map, marker, volume_util, mounter }
    }

    pub async fn run(&self, mut stop: StopSignal) {
        let mut ticker = tokio::time::interval(DEFAULT_MONITOR_RESYNC_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("local volume monitor stopping");
                    return;
                }
                _ = ticker.tick() => self.evaluate_volumes().await,
            }
        }
    }

    async fn evaluate_volumes(&self) {
        for pv in self.volume_map.snapshot() {
            self.check_status(&pv).await;
        }
    }

    /// Evaluation pipeline for one PV. Each stage either clears the PV for
    /// the next stage or ends the round, with a mark where a violation was
    /// established.
    async fn check_status(&self, pv: &PersistentVolume) {
        let Some(local) = pv.spec.as_ref().and_then(|spec| spec.local.as_ref()) else {
            debug!("PV {} is not local storage", pv.name_any());
            return;
        };

        let no_labels = BTreeMap::new();
        let node_labels = self.node.metadata.labels.as_ref().unwrap_or(&no_labels);
        match check_node_affinity(pv, node_labels) {
            Ok(true) => {}
            Ok(false) => {
                debug!("PV {} does not belong to node {}", pv.name_any(), self.node.name_any());
                return;
            }
            Err(e) => {
                error!("check node affinity error: {}", e);
                return;
            }
        }

        let Some(mount_path) = self.check_host_dir(pv, &local.path).await else {
            return;
        };

        if !self.check_mount_point(pv, &mount_path).await {
            return;
        }

        let block_mode = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.volume_mode.as_deref())
            == Some("Block");
        if block_mode {
            self.check_pv_and_block_size(pv, &mount_path).await;
        } else {
            self.check_pv_and_fs_size(pv, &mount_path).await;
        }
    }

    /// Translates the PV's host path through the DiscoveryMap and verifies
    /// something usable is behind it. Returns the mount-side path if the
    /// round should continue.
    async fn check_host_dir(&self, pv: &PersistentVolume, host_path: &str) -> Option<PathBuf> {
        let Some(mount_path) = self.resolve_mount_path(host_path) else {
            // No discovery entry covers the path; the admin likely changed
            // the provisioner config out from under this PV.
            self.mark(pv, HOST_PATH_NOT_EXIST, "yes").await;
            return None;
        };

        let dir = self.volume_util.is_dir(&mount_path);
        let block = self.volume_util.is_block(&mount_path);
        match (dir, block) {
            (Ok(true), _) | (_, Ok(true)) => Some(mount_path),
            (Ok(false), Ok(false)) => {
                self.mark(pv, HOST_PATH_NOT_EXIST, "yes").await;
                None
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("cannot stat {}: {}", mount_path.display(), e);
                None
            }
        }
    }

    fn resolve_mount_path(&self, host_path: &str) -> Option<PathBuf> {
        for config in self.discovery_map.values() {
            if let Ok(relative) = Path::new(host_path).strip_prefix(&config.host_dir) {
                return Some(Path::new(&config.mount_dir).join(relative));
            }
        }
        None
    }

    async fn check_mount_point(&self, pv: &PersistentVolume, mount_path: &Path) -> bool {
        let mount_points = match self.mounter.list() {
            Ok(mount_points) => mount_points,
            Err(e) => {
                error!("Error retrieving mount points: {}", e);
                return false;
            }
        };

        if mount_points.iter().any(|mp| mp.path == mount_path) {
            return true;
        }

        debug!("mount path is not a mount point any more: {}", mount_path.display());
        self.mark(pv, NOT_MOUNT_POINT, "yes").await;
        false
    }

    async fn check_pv_and_fs_size(&self, pv: &PersistentVolume, mount_path: &Path) {
        let capacity = match self.volume_util.fs_capacity_bytes(mount_path) {
            Ok(capacity) => capacity,
            Err(e) => {
                error!("Path {} fs stats error: {}", mount_path.display(), e);
                return;
            }
        };
        let Some(storage) = self.storage_capacity(pv) else {
            return;
        };

        // The PV may have been created by hand, so its declared capacity can
        // legitimately be below the filesystem's, never above it.
        if storage > round_down_capacity_pretty(capacity) {
            error!(
                "PV capacity must not be greater than FS capacity, PV capacity: {}, FS capacity: {}",
                storage,
                round_down_capacity_pretty(capacity)
            );
            self.mark(pv, MIS_MATCHED_VOL_SIZE, "yes").await;
            return;
        }

        let usage = match self.volume_util.dir_usage_bytes(mount_path) {
            Ok(usage) => usage,
            Err(e) => {
                error!("Path {} fs stats error: {}", mount_path.display(), e);
                return;
            }
        };
        if usage > storage {
            error!(
                "PV usage must not be greater than PV capacity, usage: {}, capacity: {}",
                usage, storage
            );
            self.mark(pv, MIS_MATCHED_VOL_SIZE, "yes").await;
        }
    }

    async fn check_pv_and_block_size(&self, pv: &PersistentVolume, mount_path: &Path) {
        let capacity = match self.volume_util.block_capacity_bytes(mount_path) {
            Ok(capacity) => capacity,
            Err(e) => {
                error!("Path {} block stats error: {}", mount_path.display(), e);
                return;
            }
        };
        let Some(storage) = self.storage_capacity(pv) else {
            return;
        };

        // Raw block usage cannot be read, so only the capacity bound applies.
        if storage > round_down_capacity_pretty(capacity) {
            error!(
                "PV capacity must not be greater than FS capacity, PV capacity: {}, FS capacity: {}",
                storage,
                round_down_capacity_pretty(capacity)
            );
            self.mark(pv, MIS_MATCHED_VOL_SIZE, "yes").await;
        }
    }

    fn storage_capacity(&self, pv: &PersistentVolume) -> Option<i64> {
        let quantity = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.capacity.as_ref())
            .and_then(|capacity| capacity.get("storage"))?;
        match quantity.to_bytes() {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => None,
            Err(e) => {
                error!("cannot parse capacity of PV {}: {}", pv.name_any(), e);
                None
            }
        }
    }

    async fn mark(&self, pv: &PersistentVolume, reason: &str, value: &str) {
        if let Err(e) = self.marker.mark(pv, reason, value).await {
            // Tolerated for this round; the next period re-examines the PV.
            warn!("mark PV {} failed: {}", pv.name_any(), e);
        }
    }
}
