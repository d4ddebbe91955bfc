use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cloudprovider::{CloudProvider, OpenStackMonitor};
use crate::config::DEFAULT_MONITOR_RESYNC_PERIOD;
use crate::volume::{cinder, hostpath, VolumePlugin};
use crate::volume_map::VolumeMap;
use crate::watch::StopSignal;

pub type PluginRegistry = HashMap<&'static str, Box<dyn VolumePlugin>>;

/// Cluster-scoped evaluator for provider-backed PVs.
///
/// Every monitor period it snapshots the volume cache and fans out one task
/// per PV, dispatching to the probe registered for the PV's source kind. An
/// unsupported kind or missing probe is logged and skipped.
pub struct RemotePVMonitor {
    volume_map: Arc<VolumeMap>,
    plugins: Arc<PluginRegistry>,
    config_path: Arc<PathBuf>,
}

impl RemotePVMonitor {
    pub fn new(
        volume_map: Arc<VolumeMap>,
        plugins: PluginRegistry,
        config_path: PathBuf,
    ) -> Self {
        RemotePVMonitor {
            volume_map,
            plugins: Arc::new(plugins),
            config_path: Arc::new(config_path),
        }
    }

    pub async fn run(&self, mut stop: StopSignal) {
        let mut ticker = tokio::time::interval(DEFAULT_MONITOR_RESYNC_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("remote volume monitor stopping");
                    return;
                }
                _ = ticker.tick() => self.evaluate_volumes().await,
            }
        }
    }

    async fn evaluate_volumes(&self) {
        for pv in self.volume_map.snapshot() {
            let plugins = Arc::clone(&self.plugins);
            let config_path = Arc::clone(&self.config_path);
            tokio::spawn(async move {
                dispatch(&plugins, &config_path, pv).await;
            });
        }
    }
}

async fn dispatch(plugins: &PluginRegistry, config_path: &Path, pv: PersistentVolume) {
    let Some(kind) = supported_volume_kind(&pv) else {
        warn!("unsupported volume type found in PV {}", pv.name_any());
        return;
    };
    let Some(plugin) = plugins.get(kind) else {
        warn!("no {} probe registered, skipping PV {}", kind, pv.name_any());
        return;
    };
    if let Err(e) = plugin.check_volume_status(&pv, config_path).await {
        warn!("PV {} failed its {} health probe: {}", pv.name_any(), kind, e);
    }
}

/// The remote source kinds this dispatcher knows how to route.
pub fn supported_volume_kind(pv: &PersistentVolume) -> Option<&'static str> {
    let spec = pv.spec.as_ref()?;
    if spec.host_path.is_some() {
        return Some(hostpath::PLUGIN_NAME);
    }
    if spec.cinder.is_some() {
        return Some(cinder::PLUGIN_NAME);
    }
    None
}

/// Builds the probe registry. The host-path probe is always available; the
/// Cinder probe is registered only when the matching storage driver was
/// requested, initialized with a cloud handle built from its config file.
pub fn build_volume_plugins(
    storage_driver: Option<&str>,
    config_path: Option<&Path>,
) -> Result<PluginRegistry> {
    let mut plugins: PluginRegistry = HashMap::new();

    if let Some(driver) = storage_driver {
        if driver == cinder::PLUGIN_NAME {
            let Some(config_path) = config_path else {
                bail!("--storage-driver-config-file is required for the {} driver", driver);
            };
            let cloud = OpenStackMonitor::from_config(config_path)
                .wrap_err("failed to initialize cloud provider")?;
            let mut plugin = cinder::CinderPlugin::new();
            plugin.init(Some(Arc::new(cloud) as Arc<dyn CloudProvider>));
            plugins.insert(cinder::PLUGIN_NAME, Box::new(plugin));
            info!("registered {} volume probe", cinder::PLUGIN_NAME);
        } else {
            warn!("unknown storage driver {}, no cloud probe registered", driver);
        }
    }

    plugins.insert(hostpath::PLUGIN_NAME, Box::new(hostpath::HostPathPlugin::new()));
    Ok(plugins)
}
