use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudProviderError {
    #[error("cannot read cloud provider config {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to a storage provider's control plane, queried by remote probes.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn check_volume_status(&self, volume_id: &str) -> Result<(), CloudProviderError>;
}

/// OpenStack handle backing the Cinder probe.
pub struct OpenStackMonitor {
    #[allow(dead_code)]
    config_path: PathBuf,
}

impl OpenStackMonitor {
    pub fn from_config(config_path: &Path) -> Result<Self, CloudProviderError> {
        fs::metadata(config_path).map_err(|source| CloudProviderError::Config {
            path: config_path.display().to_string(),
            source,
        })?;
        Ok(OpenStackMonitor { config_path: config_path.to_path_buf() })
    }
}

#[async_trait]
impl CloudProvider for OpenStackMonitor {
    async fn check_volume_status(&self, _volume_id: &str) -> Result<(), CloudProviderError> {
        Ok(())
    }
}
