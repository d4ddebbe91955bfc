use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;

use crate::cloudprovider::CloudProvider;
use crate::volume::{PluginError, VolumePlugin};

pub const PLUGIN_NAME: &str = "hostpath";

/// Probe for host-path PVs. Host paths carry no remote state to query, so a
/// well-formed source is all it takes to pass.
#[derive(Default)]
pub struct HostPathPlugin;

impl HostPathPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VolumePlugin for HostPathPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, _cloud: Option<Arc<dyn CloudProvider>>) {}

    async fn check_volume_status(
        &self,
        pv: &PersistentVolume,
        _config_path: &Path,
    ) -> Result<(), PluginError> {
        pv.spec
            .as_ref()
            .and_then(|spec| spec.host_path.as_ref())
            .ok_or_else(|| PluginError::InvalidSource { kind: PLUGIN_NAME, pv: pv.name_any() })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, PersistentVolumeSpec};

    #[tokio::test]
    async fn host_path_pv_passes() {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv-h".into());
        pv.spec = Some(PersistentVolumeSpec {
            host_path: Some(HostPathVolumeSource { path: "/data".into(), ..Default::default() }),
            ..Default::default()
        });

        let plugin = HostPathPlugin::new();
        assert!(plugin.check_volume_status(&pv, Path::new("")).await.is_ok());
    }

    #[tokio::test]
    async fn other_pv_is_an_invalid_source() {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv-x".into());

        let plugin = HostPathPlugin::new();
        let result = plugin.check_volume_status(&pv, Path::new("")).await;
        assert!(matches!(result, Err(PluginError::InvalidSource { .. })));
    }
}
