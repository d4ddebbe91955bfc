use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use thiserror::Error;

use crate::cloudprovider::{CloudProvider, CloudProviderError};

pub mod cinder;
pub mod hostpath;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid {kind} volume source on PV {pv}")]
    InvalidSource { kind: &'static str, pv: String },

    #[error("no cloud provider configured for {0}")]
    NoCloudProvider(&'static str),

    #[error(transparent)]
    Cloud(#[from] CloudProviderError),
}

/// A remote volume probe. The dispatcher looks probes up by source kind;
/// what "unhealthy" means is entirely the probe's business.
#[async_trait]
pub trait VolumePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hands the probe its cloud-provider handle. Probes without a cloud
    /// dependency ignore it.
    fn init(&mut self, cloud: Option<Arc<dyn CloudProvider>>);

    async fn check_volume_status(
        &self,
        pv: &PersistentVolume,
        config_path: &Path,
    ) -> Result<(), PluginError>;
}
