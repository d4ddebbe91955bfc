use std::path::{Path, PathBuf};
use std::sync::Arc;

use build_time::build_time_local;
use clap::Parser;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{
    CINDER_PV_TYPE, HOSTPATH_PV_TYPE, LOCAL_PV_TYPE, MONITOR_CONFIG_PATH, NODE_NAME_ENV,
    PROVISIONER_CONFIG_PATH, SUPPORTED_STORAGE_TYPES,
};
use crate::local_monitor::LocalPVMonitor;
use crate::mark::{MarkEngine, VolumeMarker};
use crate::node_map::NodeMap;
use crate::node_watcher::NodeWatcher;
use crate::remote_monitor::{build_volume_plugins, RemotePVMonitor};
use crate::volume_map::VolumeMap;
use crate::volume_util::{ProcMounter, StdVolumeUtil};
use crate::watch::{run_volume_watch, StopSignal};
use crate::work_queue::WorkQueue;

pub mod cloudprovider;
pub mod config;
pub mod ext;
pub mod local_monitor;
pub mod mark;
pub mod monitor_config;
pub mod node_affinity;
pub mod node_map;
pub mod node_watcher;
pub mod quantity_parser;
pub mod remote_monitor;
pub mod volume;
pub mod volume_map;
pub mod volume_util;
pub mod watch;
pub mod work_queue;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Storage types to monitor; comma-separated subset of local_pv, cinder_pv, hostpath_pv
    #[arg(long, value_delimiter = ',')]
    kube_storage_types: Vec<String>,

    /// Watch node liveness and mark local PVs on broken nodes
    #[arg(long, default_value_t = false)]
    enable_node_watcher: bool,

    /// Remote storage provider to probe, e.g. cinder
    #[arg(long)]
    storage_driver: Option<String>,

    /// Path to the remote provider's configuration file
    #[arg(long)]
    storage_driver_config_file: Option<PathBuf>,
}

fn validate(cli: &Cli) -> Result<()> {
    if cli.kube_storage_types.is_empty() && !cli.enable_node_watcher {
        bail!("at least one of --kube-storage-types or --enable-node-watcher must be set");
    }
    for storage_type in &cli.kube_storage_types {
        if !SUPPORTED_STORAGE_TYPES.contains(storage_type.as_str()) {
            bail!("monitor does not support {} storage type", storage_type);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!(
        "Running pv-health-monitor v{} built at {}",
        config::VERSION,
        build_time_local!()
    );

    let cli = Cli::parse();
    validate(&cli)?;

    // Tries ~/.kube/config first and falls back to the in-cluster service
    // account.
    let client = Client::try_default()
        .await
        .wrap_err("Failed to create Kube client")?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if cli.kube_storage_types.iter().any(|t| t == LOCAL_PV_TYPE) {
        tasks.extend(start_local_pv_monitor(client.clone(), stop_rx.clone()).await?);
    }

    if cli
        .kube_storage_types
        .iter()
        .any(|t| t == CINDER_PV_TYPE || t == HOSTPATH_PV_TYPE)
    {
        tasks.extend(start_remote_pv_monitor(
            client.clone(),
            cli.storage_driver.as_deref(),
            cli.storage_driver_config_file.clone(),
            stop_rx.clone(),
        )?);
    }

    if cli.enable_node_watcher {
        tasks.push(start_node_watcher(client, stop_rx));
    }

    wait_for_stop_signal().await?;
    info!("stop signal received, shutting down");
    let _ = stop_tx.send(());

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

/// Assembles the node-local agent: configuration, the Node this process is
/// bound to, the PV watch and the evaluator loop. Configuration problems are
/// fatal here, before anything is spawned.
async fn start_local_pv_monitor(client: Client, stop: StopSignal) -> Result<Vec<JoinHandle<()>>> {
    let monitor_config = monitor_config::load_monitor_config(Path::new(MONITOR_CONFIG_PATH))?;
    let provisioner_config =
        monitor_config::load_provisioner_config(Path::new(PROVISIONER_CONFIG_PATH))?;

    let node_name = std::env::var(NODE_NAME_ENV)
        .map_err(|_| eyre!("{} environment variable not set", NODE_NAME_ENV))?;
    let node = Api::<Node>::all(client.clone())
        .get(&node_name)
        .await
        .wrap_err("Could not get node information")?;

    let monitor_name = format!(
        "local-volume-monitor-{}-{}",
        node.name_any(),
        node.metadata.uid.clone().unwrap_or_default()
    );

    let volume_map = Arc::new(VolumeMap::new());
    let marker: Arc<dyn VolumeMarker> = Arc::new(MarkEngine::with_client(
        client.clone(),
        monitor_name,
        Some(Arc::clone(&volume_map)),
    ));

    let label_selector = (!monitor_config.label_selector_for_pv.is_empty())
        .then(|| monitor_config.label_selector_for_pv.clone());

    let monitor = LocalPVMonitor::new(
        node,
        provisioner_config.storage_class_map,
        Arc::clone(&volume_map),
        marker,
        Arc::new(StdVolumeUtil),
        Arc::new(ProcMounter),
    );

    info!("Starting local PVs monitor");
    let watch = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = run_volume_watch(client, label_selector, volume_map, true, stop).await {
                error!("volume watch failed: {}", e);
            }
        })
    };
    let evaluator = tokio::spawn(async move { monitor.run(stop).await });

    Ok(vec![watch, evaluator])
}

/// Assembles the remote agent: probe registry, an unfiltered PV watch and
/// the dispatcher loop.
fn start_remote_pv_monitor(
    client: Client,
    storage_driver: Option<&str>,
    config_file: Option<PathBuf>,
    stop: StopSignal,
) -> Result<Vec<JoinHandle<()>>> {
    let plugins = build_volume_plugins(storage_driver, config_file.as_deref())?;

    let volume_map = Arc::new(VolumeMap::new());
    let monitor = RemotePVMonitor::new(
        Arc::clone(&volume_map),
        plugins,
        config_file.unwrap_or_default(),
    );

    info!("Starting remote PVs monitor");
    let watch = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = run_volume_watch(client, None, volume_map, false, stop).await {
                error!("volume watch failed: {}", e);
            }
        })
    };
    let evaluator = tokio::spawn(async move { monitor.run(stop).await });

    Ok(vec![watch, evaluator])
}

fn start_node_watcher(client: Client, stop: StopSignal) -> JoinHandle<()> {
    let marker: Arc<dyn VolumeMarker> =
        Arc::new(MarkEngine::with_client(client.clone(), "node-watcher".to_string(), None));
    let watcher = NodeWatcher::new(
        Arc::new(NodeMap::new()),
        Arc::new(NodeMap::new()),
        Arc::new(WorkQueue::new()),
        Arc::new(VolumeMap::new()),
        marker,
    );

    tokio::spawn(async move {
        if let Err(e) = watcher.run(client, stop).await {
            error!("node watcher failed: {}", e);
        }
    })
}

async fn wait_for_stop_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.wrap_err("cannot listen for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
