use std::collections::HashSet;
use std::sync::Arc;

use color_eyre::Result;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use kube::api::ListParams;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client, ResourceExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::DEFAULT_INFORMER_RESYNC_PERIOD;
use crate::node_map::NodeMap;
use crate::volume_map::VolumeMap;
use crate::work_queue::WorkQueue;

/// Receiver side of the process-wide stop signal. Loops observe it at their
/// next suspension point.
pub type StopSignal = tokio::sync::watch::Receiver<()>;

/// Watches PersistentVolumes into `volume_map`.
///
/// The cache is seeded with a full list before the watch starts, and an
/// informer-resync ticker re-lists periodically so the cache converges even
/// if watch events were missed. With `local_only`, PVs without a local source
/// are not cached.
pub async fn run_volume_watch(
    client: Client,
    label_selector: Option<String>,
    volume_map: Arc<VolumeMap>,
    local_only: bool,
    mut stop: StopSignal,
) -> Result<()> {
    let api: Api<PersistentVolume> = Api::all(client);
    match list_volumes(&api, &label_selector).await {
        Ok(volumes) => reconcile_volumes(&volume_map, volumes, local_only),
        Err(e) => warn!("cannot list volumes at startup: {}", e),
    }

    let config = watcher::Config {
        label_selector: label_selector.clone(),
        ..Default::default()
    };
    let mut stream = watcher(api.clone(), config).boxed();

    let mut resync = tokio::time::interval(DEFAULT_INFORMER_RESYNC_PERIOD);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    resync.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("volume watch stopping");
                return Ok(());
            }
            _ = resync.tick() => {
                match list_volumes(&api, &label_selector).await {
                    Ok(volumes) => reconcile_volumes(&volume_map, volumes, local_only),
                    Err(e) => warn!("cannot re-list volumes: {}", e),
                }
            }
            event = stream.next() => match event {
                Some(Ok(Event::Applied(pv))) => {
                    if is_relevant(&pv, local_only) {
                        volume_map.add_or_update(&pv);
                    }
                }
                Some(Ok(Event::Deleted(pv))) => volume_map.delete(&pv.name_any()),
                Some(Ok(Event::Restarted(volumes))) => {
                    reconcile_volumes(&volume_map, volumes, local_only)
                }
                Some(Err(e)) => warn!("volume watch error: {}", e),
                None => return Ok(()),
            }
        }
    }
}

/// Watches Nodes into the informer-side cache and enqueues every observed
/// key for the node worker.
pub async fn run_node_watch(
    client: Client,
    informer: Arc<NodeMap>,
    queue: Arc<WorkQueue>,
    mut stop: StopSignal,
) -> Result<()> {
    let api: Api<Node> = Api::all(client);
    let mut stream = watcher(api.clone(), watcher::Config::default()).boxed();

    let mut resync = tokio::time::interval(DEFAULT_INFORMER_RESYNC_PERIOD);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    resync.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("node watch stopping");
                return Ok(());
            }
            _ = resync.tick() => {
                match api.list(&ListParams::default()).await {
                    Ok(nodes) => {
                        reconcile_nodes(&informer, nodes.items.clone());
                        for node in nodes.items {
                            queue.add(node.name_any());
                        }
                    }
                    Err(e) => warn!("cannot re-list nodes: {}", e),
                }
            }
            event = stream.next() => match event {
                Some(Ok(Event::Applied(node))) => {
                    informer.add_or_update(&node);
                    queue.add(node.name_any());
                }
                Some(Ok(Event::Deleted(node))) => {
                    informer.delete(&node.name_any());
                    queue.add(node.name_any());
                }
                Some(Ok(Event::Restarted(nodes))) => {
                    reconcile_nodes(&informer, nodes.clone());
                    for node in nodes {
                        queue.add(node.name_any());
                    }
                }
                Some(Err(e)) => warn!("node watch error: {}", e),
                None => return Ok(()),
            }
        }
    }
}

pub async fn list_volumes(
    api: &Api<PersistentVolume>,
    label_selector: &Option<String>,
) -> kube::Result<Vec<PersistentVolume>> {
    let mut params = ListParams::default();
    if let Some(selector) = label_selector {
        params = params.labels(selector);
    }
    Ok(api.list(&params).await?.items)
}

/// Brings the cache in line with a freshly-listed set: stale entries are
/// deleted, everything listed is (re-)inserted.
pub fn reconcile_volumes(volume_map: &VolumeMap, volumes: Vec<PersistentVolume>, local_only: bool) {
    let volumes: Vec<PersistentVolume> = volumes
        .into_iter()
        .filter(|pv| is_relevant(pv, local_only))
        .collect();
    let listed: HashSet<String> = volumes.iter().map(ResourceExt::name_any).collect();

    for name in volume_map.names() {
        if !listed.contains(&name) {
            volume_map.delete(&name);
        }
    }
    for pv in &volumes {
        volume_map.add_or_update(pv);
    }
}

pub fn reconcile_nodes(node_map: &NodeMap, nodes: Vec<Node>) {
    let listed: HashSet<String> = nodes.iter().map(ResourceExt::name_any).collect();

    for name in node_map.names() {
        if !listed.contains(&name) {
            node_map.delete(&name);
        }
    }
    for node in &nodes {
        node_map.add_or_update(node);
    }
}

fn is_relevant(pv: &PersistentVolume, local_only: bool) -> bool {
    !local_only || pv.spec.as_ref().is_some_and(|spec| spec.local.is_some())
}
