use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::Deserialize;

/// Configuration of the monitor itself, mounted as a config map at
/// [crate::config::MONITOR_CONFIG_PATH].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfiguration {
    /// Label selector scoping the PV watch.
    #[serde(rename = "labelSelectorForPV")]
    pub label_selector_for_pv: String,
}

/// The slice of the local-volume provisioner's configuration this monitor
/// consumes. Owned and documented by the provisioner; read-only here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfiguration {
    /// StorageClass name → host/mount directory pair (the DiscoveryMap).
    #[serde(rename = "storageClassMap")]
    pub storage_class_map: HashMap<String, MountConfig>,

    #[serde(rename = "nodeLabelsForPV")]
    pub node_labels_for_pv: Vec<String>,

    #[serde(rename = "useAlphaAPI")]
    pub use_alpha_api: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    /// Volume directory as seen from the host.
    #[serde(rename = "hostDir")]
    pub host_dir: String,

    /// The same directory as mounted into the monitor's container.
    #[serde(rename = "mountDir")]
    pub mount_dir: String,
}

pub fn load_monitor_config(config_path: &Path) -> Result<MonitorConfiguration> {
    let data = read_config_dir(config_path)?;
    parse_config_map_data(&data)
        .wrap_err_with(|| format!("invalid monitor configuration in {}", config_path.display()))
}

pub fn load_provisioner_config(config_path: &Path) -> Result<ProvisionerConfiguration> {
    let data = read_config_dir(config_path)?;
    parse_config_map_data(&data)
        .wrap_err_with(|| format!("invalid provisioner configuration in {}", config_path.display()))
}

/// Reads a config-map volume: each regular file is one top-level key, its
/// contents the value. The `..data` symlink directory maintained by the
/// kubelet is skipped.
fn read_config_dir(config_path: &Path) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::new();
    let entries = fs::read_dir(config_path)
        .wrap_err_with(|| format!("cannot read config directory {}", config_path.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "..data" {
            continue;
        }
        let contents = fs::read_to_string(entry.path())
            .wrap_err_with(|| format!("cannot read config file {}", entry.path().display()))?;
        data.insert(name, contents);
    }
    Ok(data)
}

/// Stitches the per-file key/value pairs into one YAML document and parses
/// it. File contents are indented under their key so both scalar values and
/// nested mappings round-trip.
fn parse_config_map_data<T: for<'de> Deserialize<'de> + Default>(
    data: &BTreeMap<String, String>,
) -> Result<T> {
    let mut raw_yaml = String::new();
    for (key, value) in data {
        raw_yaml.push_str(key);
        raw_yaml.push_str(": \n");
        for line in value.lines() {
            raw_yaml.push_str("   ");
            raw_yaml.push_str(line);
            raw_yaml.push('\n');
        }
    }

    if raw_yaml.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_str(&raw_yaml)?)
}
