use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;

/// Concurrent cache of the last-observed PersistentVolume objects, keyed by
/// PV name. Writers are the watch drivers and the mark engine (post-image
/// after a successful update); readers are the evaluator loops.
#[derive(Default)]
pub struct VolumeMap {
    volumes: RwLock<HashMap<String, PersistentVolume>>,
}

impl VolumeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_or_update(&self, pv: &PersistentVolume) {
        let mut volumes = self.volumes.write().unwrap();
        volumes.insert(pv.name_any(), pv.clone());
    }

    pub fn delete(&self, name: &str) {
        let mut volumes = self.volumes.write().unwrap();
        volumes.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        let volumes = self.volumes.read().unwrap();
        volumes.get(name).cloned()
    }

    /// Point-in-time copy of the cached PVs. Iteration over the returned
    /// vector is unaffected by concurrent mutation of the map.
    pub fn snapshot(&self) -> Vec<PersistentVolume> {
        let volumes = self.volumes.read().unwrap();
        volumes.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let volumes = self.volumes.read().unwrap();
        volumes.keys().cloned().collect()
    }
}
