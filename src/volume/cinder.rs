use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;

use crate::cloudprovider::CloudProvider;
use crate::volume::{PluginError, VolumePlugin};

pub const PLUGIN_NAME: &str = "cinder";

/// Probe for Cinder-backed PVs; asks the OpenStack control plane about the
/// volume behind the PV.
#[derive(Default)]
pub struct CinderPlugin {
    cloud: Option<Arc<dyn CloudProvider>>,
}

impl CinderPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VolumePlugin for CinderPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, cloud: Option<Arc<dyn CloudProvider>>) {
        self.cloud = cloud;
    }

    async fn check_volume_status(
        &self,
        pv: &PersistentVolume,
        _config_path: &Path,
    ) -> Result<(), PluginError> {
        let cinder = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.cinder.as_ref())
            .ok_or_else(|| PluginError::InvalidSource { kind: PLUGIN_NAME, pv: pv.name_any() })?;

        let cloud = self
            .cloud
            .as_ref()
            .ok_or(PluginError::NoCloudProvider(PLUGIN_NAME))?;
        cloud.check_volume_status(&cinder.volume_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::CloudProviderError;
    use k8s_openapi::api::core::v1::{CinderPersistentVolumeSource, PersistentVolumeSpec};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCloud {
        queried: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudProvider for RecordingCloud {
        async fn check_volume_status(&self, volume_id: &str) -> Result<(), CloudProviderError> {
            self.queried.lock().unwrap().push(volume_id.to_string());
            Ok(())
        }
    }

    fn cinder_pv(name: &str, volume_id: &str) -> PersistentVolume {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some(name.into());
        pv.spec = Some(PersistentVolumeSpec {
            cinder: Some(CinderPersistentVolumeSource {
                volume_id: volume_id.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        pv
    }

    #[tokio::test]
    async fn queries_the_cloud_for_the_backing_volume() {
        let cloud = Arc::new(RecordingCloud::default());
        let mut plugin = CinderPlugin::new();
        plugin.init(Some(Arc::<RecordingCloud>::clone(&cloud)));

        plugin
            .check_volume_status(&cinder_pv("pv-c", "vol-42"), Path::new("/etc/cloud.conf"))
            .await
            .unwrap();

        assert_eq!(*cloud.queried.lock().unwrap(), vec!["vol-42".to_string()]);
    }

    #[tokio::test]
    async fn non_cinder_pv_is_an_invalid_source() {
        let plugin = CinderPlugin::new();
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv-x".into());

        let result = plugin.check_volume_status(&pv, Path::new("/etc/cloud.conf")).await;
        assert!(matches!(result, Err(PluginError::InvalidSource { .. })));
    }

    #[tokio::test]
    async fn uninitialized_plugin_reports_missing_cloud() {
        let plugin = CinderPlugin::new();
        let result = plugin
            .check_volume_status(&cinder_pv("pv-c", "vol-42"), Path::new("/etc/cloud.conf"))
            .await;
        assert!(matches!(result, Err(PluginError::NoCloudProvider(_))));
    }
}
