use std::collections::HashMap;

use chrono::{DateTime, Utc};
use color_eyre::eyre::bail;
use color_eyre::Result;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{
    DEFAULT_MONITOR_RESYNC_PERIOD, DEFAULT_NODE_NOT_READY_DURATION, NODE_FAILURE,
    NODE_RECHECK_DELAY,
};
use crate::mark::VolumeMarker;
use crate::node_affinity::check_node_affinity;
use crate::node_map::NodeMap;
use crate::volume_map::VolumeMap;
use crate::watch::{run_node_watch, run_volume_watch, StopSignal};
use crate::work_queue::WorkQueue;

#[derive(Debug, PartialEq, Eq)]
enum NodeHealth {
    Healthy,
    GracePending,
    Broken,
}

/// Cluster-scoped evaluator that watches node liveness and, once a node is
/// deemed broken, cascades a `NodeFailure` mark to every local PV whose
/// affinity targets it.
///
/// Two node caches are kept: `informer` mirrors the watch's view of the
/// cluster, `node_map` holds the last-seen copy so a key missing from the
/// informer can still be resolved to the deleted node. The first-NotReady
/// side table is owned exclusively by the drain task.
pub struct NodeWatcher {
    informer: Arc<NodeMap>,
    node_map: Arc<NodeMap>,
    queue: Arc<WorkQueue>,
    volume_map: Arc<VolumeMap>,
    marker: Arc<dyn VolumeMarker>,
    node_first_broken: HashMap<String, DateTime<Utc>>,
}

impl NodeWatcher {
    pub fn new(
        informer: Arc<NodeMap>,
        node_map: Arc<NodeMap>,
        queue: Arc<WorkQueue>,
        volume_map: Arc<VolumeMap>,
        marker: Arc<dyn VolumeMarker>,
    ) -> Self {
        NodeWatcher {
            informer,
            node_map,
            queue,
            volume_map,
            marker,
            node_first_broken: HashMap::new(),
        }
    }

    /// Seeds the caches, starts the watch and resync tasks, then drains the
    /// node queue until the stop signal fires.
    pub async fn run(mut self, client: Client, stop: StopSignal) -> Result<()> {
        match Api::<Node>::all(client.clone()).list(&ListParams::default()).await {
            Ok(nodes) => {
                for node in nodes.items {
                    self.informer.add_or_update(&node);
                    self.node_map.add_or_update(&node);
                    self.queue.add(node.name_any());
                }
            }
            Err(e) => warn!("cannot list nodes at startup: {}", e),
        }

        let node_watch = tokio::spawn(run_node_watch(
            client.clone(),
            Arc::clone(&self.informer),
            Arc::clone(&self.queue),
            stop.clone(),
        ));
        let volume_watch = tokio::spawn(run_volume_watch(
            client,
            None,
            Arc::clone(&self.volume_map),
            true,
            stop.clone(),
        ));

        // Our own resync on top of the informer's: re-enqueue every known
        // node so grace windows are re-evaluated without fresh events.
        let resync = {
            let informer = Arc::clone(&self.informer);
            let queue = Arc::clone(&self.queue);
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DEFAULT_MONITOR_RESYNC_PERIOD);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.changed() => return,
                        _ = ticker.tick() => {
                            for node in informer.snapshot() {
                                queue.add(node.name_any());
                            }
                        }
                    }
                }
            })
        };

        let shutdown = {
            let queue = Arc::clone(&self.queue);
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let _ = stop.changed().await;
                queue.shut_down();
            })
        };

        info!("node watcher started");
        while let Some(key) = self.queue.get().await {
            self.process_key(&key, Utc::now()).await;
        }
        info!("node worker queue shutting down");

        let _ = tokio::join!(node_watch, volume_watch, resync, shutdown);
        Ok(())
    }

    /// Resolves a drained key against the informer: a hit is an add/update/
    /// sync, a miss with a last-seen copy is a deletion.
    async fn process_key(&mut self, key: &str, now: DateTime<Utc>) {
        match self.informer.get(key) {
            Some(node) => self.update_node(key, &node, now).await,
            None => match self.node_map.get(key) {
                Some(node) => self.delete_node(key, &node).await,
                None => debug!("deletion of node {} was already processed", key),
            },
        }
    }

    async fn update_node(&mut self, key: &str, node: &Node, now: DateTime<Utc>) {
        self.node_map.add_or_update(node);

        match self.classify(key, node, now) {
            NodeHealth::Healthy => {}
            NodeHealth::GracePending => {
                debug!("node {} is not ready, still within the grace window", key);
                self.queue.add_after(key, NODE_RECHECK_DELAY);
            }
            NodeHealth::Broken => {
                info!("node {} is broken", key);
                match self.mark_local_pvs_on_node(node).await {
                    Ok(()) => {
                        self.node_map.delete(key);
                        self.node_first_broken.remove(key);
                    }
                    Err(e) => {
                        warn!("marking local PVs on node {} failed, re-enqueue: {}", key, e);
                        self.queue.add(key);
                    }
                }
            }
        }
    }

    async fn delete_node(&mut self, key: &str, node: &Node) {
        info!("node {} is deleted, so mark the local PVs on it", key);
        match self.mark_local_pvs_on_node(node).await {
            Ok(()) => {
                self.node_map.delete(key);
                self.node_first_broken.remove(key);
            }
            Err(e) => {
                warn!("marking local PVs on deleted node {} failed, re-enqueue: {}", key, e);
                self.queue.add(key);
            }
        }
    }

    /// The per-node state machine. A Terminated phase is broken outright;
    /// a NotReady condition starts the grace timer and is broken only once
    /// strictly more than the grace window has elapsed.
    fn classify(&mut self, key: &str, node: &Node, now: DateTime<Utc>) -> NodeHealth {
        if node.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Terminated") {
            return NodeHealth::Broken;
        }

        if let Some(ready) = ready_condition_status(node) {
            if ready != "True" {
                return match self.node_first_broken.get(key) {
                    Some(first_seen) => {
                        let not_ready_seconds = (now - *first_seen).num_seconds();
                        if not_ready_seconds > DEFAULT_NODE_NOT_READY_DURATION.as_secs() as i64 {
                            NodeHealth::Broken
                        } else {
                            NodeHealth::GracePending
                        }
                    }
                    None => {
                        self.node_first_broken.insert(key.to_string(), now);
                        NodeHealth::GracePending
                    }
                };
            }
        }

        // Ready again (or no Ready condition at all): forget the timer.
        self.node_first_broken.remove(key);
        NodeHealth::Healthy
    }

    /// Cascades the failure mark to every local PV bound to the node.
    /// Individual mark failures are collected; an affinity evaluation error
    /// aborts the cascade so the caller retries the whole node.
    async fn mark_local_pvs_on_node(&self, node: &Node) -> Result<()> {
        let node_labels = node.metadata.labels.clone().unwrap_or_default();

        let mut mark_err_happened = false;
        for pv in self.volume_map.snapshot() {
            if pv.spec.as_ref().and_then(|spec| spec.local.as_ref()).is_none() {
                continue;
            }
            if !check_node_affinity(&pv, &node_labels)? {
                continue;
            }
            if let Err(e) = self.marker.mark(&pv, NODE_FAILURE, "true").await {
                mark_err_happened = true;
                error!("mark local PV {} failed: {}", pv.name_any(), e);
            }
        }

        if mark_err_happened {
            bail!("error happened when marking local PVs on node {}", node.name_any());
        }
        Ok(())
    }
}

fn ready_condition_status(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|condition| condition.type_ == "Ready")
        .map(|condition| condition.status.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use k8s_openapi::api::core::v1::{
        LocalVolumeSource, NodeCondition, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        NodeStatus, PersistentVolumeSpec, VolumeNodeAffinity,
    };
    use kube::core::ErrorResponse;
    use std::sync::Mutex;

    struct RecordingMarker {
        marks: Mutex<Vec<(String, String, String)>>,
        fail: bool,
    }

    impl RecordingMarker {
        fn new(fail: bool) -> Self {
            RecordingMarker { marks: Mutex::new(Vec::new()), fail }
        }

        fn recorded(&self) -> Vec<(String, String, String)> {
            self.marks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VolumeMarker for RecordingMarker {
        async fn mark(&self, pv: &PersistentVolume, reason: &str, value: &str) -> kube::Result<()> {
            if self.fail {
                return Err(kube::Error::Api(ErrorResponse {
                    status: "Failure".into(),
                    message: "boom".into(),
                    reason: "InternalError".into(),
                    code: 500,
                }));
            }
            self.marks
                .lock()
                .unwrap()
                .push((pv.name_any(), reason.to_string(), value.to_string()));
            Ok(())
        }
    }

    fn node_with_ready(name: &str, ready: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.into());
        node.metadata.labels =
            Some([("kubernetes.io/hostname".to_string(), name.to_string())].into());
        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: ready.into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        node
    }

    fn terminated_node(name: &str) -> Node {
        let mut node = node_with_ready(name, "False");
        node.status.as_mut().unwrap().phase = Some("Terminated".into());
        node
    }

    fn local_pv(name: &str, node_name: &str) -> PersistentVolume {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some(name.into());
        pv.spec = Some(PersistentVolumeSpec {
            local: Some(LocalVolumeSource {
                path: format!("/mnt/disks/{}", name),
                ..Default::default()
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "kubernetes.io/hostname".into(),
                            operator: "In".into(),
                            values: Some(vec![node_name.into()]),
                        }]),
                        ..Default::default()
                    }],
                }),
            }),
            ..Default::default()
        });
        pv
    }

    fn non_local_pv(name: &str) -> PersistentVolume {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some(name.into());
        pv.spec = Some(PersistentVolumeSpec::default());
        pv
    }

    fn watcher(marker: Arc<RecordingMarker>, pvs: Vec<PersistentVolume>) -> NodeWatcher {
        let volume_map = Arc::new(VolumeMap::new());
        for pv in &pvs {
            volume_map.add_or_update(pv);
        }
        NodeWatcher::new(
            Arc::new(NodeMap::new()),
            Arc::new(NodeMap::new()),
            Arc::new(WorkQueue::new()),
            volume_map,
            marker,
        )
    }

    #[tokio::test]
    async fn not_ready_node_gets_a_grace_window() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(Arc::clone(&marker), vec![local_pv("pv-a", "n1")]);
        let node = node_with_ready("n1", "False");
        let t0 = Utc::now();

        assert_eq!(watcher.classify("n1", &node, t0), NodeHealth::GracePending);
        assert_eq!(
            watcher.classify("n1", &node, t0 + Duration::seconds(60)),
            NodeHealth::GracePending
        );
        // strictly greater than the window: 120 s on the dot is still pending
        assert_eq!(
            watcher.classify("n1", &node, t0 + Duration::seconds(120)),
            NodeHealth::GracePending
        );
        assert_eq!(
            watcher.classify("n1", &node, t0 + Duration::seconds(121)),
            NodeHealth::Broken
        );
    }

    #[tokio::test]
    async fn recovery_within_grace_clears_the_timer() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(Arc::clone(&marker), vec![local_pv("pv-a", "n1")]);
        let t0 = Utc::now();

        watcher.classify("n1", &node_with_ready("n1", "False"), t0);
        assert_eq!(
            watcher.classify("n1", &node_with_ready("n1", "True"), t0 + Duration::seconds(60)),
            NodeHealth::Healthy
        );
        assert!(watcher.node_first_broken.is_empty());

        // a fresh NotReady starts a fresh window
        assert_eq!(
            watcher.classify("n1", &node_with_ready("n1", "False"), t0 + Duration::seconds(90)),
            NodeHealth::GracePending
        );
        assert!(marker.recorded().is_empty());
    }

    #[tokio::test]
    async fn unknown_ready_status_counts_as_not_ready() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(marker, vec![]);
        assert_eq!(
            watcher.classify("n1", &node_with_ready("n1", "Unknown"), Utc::now()),
            NodeHealth::GracePending
        );
    }

    #[tokio::test]
    async fn terminated_node_is_broken_without_grace() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(marker, vec![]);
        assert_eq!(
            watcher.classify("n1", &terminated_node("n1"), Utc::now()),
            NodeHealth::Broken
        );
    }

    #[tokio::test]
    async fn broken_node_cascades_to_its_local_pvs_only() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(
            Arc::clone(&marker),
            vec![local_pv("pv-a", "n1"), local_pv("pv-b", "n2"), non_local_pv("pv-c")],
        );
        let node = terminated_node("n1");
        watcher.informer.add_or_update(&node);

        watcher.process_key("n1", Utc::now()).await;

        assert_eq!(
            marker.recorded(),
            vec![("pv-a".to_string(), NODE_FAILURE.to_string(), "true".to_string())]
        );
        assert!(watcher.node_map.get("n1").is_none());
        assert!(watcher.node_first_broken.is_empty());
    }

    #[tokio::test]
    async fn grace_window_end_to_end() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(Arc::clone(&marker), vec![local_pv("pv-a", "n1")]);
        let node = node_with_ready("n1", "False");
        let t0 = Utc::now();

        watcher.update_node("n1", &node, t0).await;
        watcher.update_node("n1", &node, t0 + Duration::seconds(60)).await;
        assert!(marker.recorded().is_empty());

        watcher.update_node("n1", &node, t0 + Duration::seconds(130)).await;
        assert_eq!(
            marker.recorded(),
            vec![("pv-a".to_string(), NODE_FAILURE.to_string(), "true".to_string())]
        );
        assert!(watcher.node_map.get("n1").is_none());
        assert!(watcher.node_first_broken.is_empty());
    }

    #[tokio::test]
    async fn deleted_node_cascades_from_the_last_seen_copy() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(Arc::clone(&marker), vec![local_pv("pv-a", "n1")]);
        let node = node_with_ready("n1", "True");
        watcher.node_map.add_or_update(&node);
        watcher.node_first_broken.insert("n1".into(), Utc::now());

        // informer no longer knows the node: this is a deletion
        watcher.process_key("n1", Utc::now()).await;

        assert_eq!(marker.recorded()[0].1, NODE_FAILURE);
        assert!(watcher.node_map.get("n1").is_none());
        assert!(watcher.node_first_broken.is_empty());
    }

    #[tokio::test]
    async fn mark_failure_re_enqueues_and_keeps_the_node() {
        let marker = Arc::new(RecordingMarker::new(true));
        let mut watcher = watcher(marker, vec![local_pv("pv-a", "n1")]);
        let node = terminated_node("n1");
        watcher.informer.add_or_update(&node);

        watcher.process_key("n1", Utc::now()).await;

        assert!(watcher.node_map.get("n1").is_some());
        assert_eq!(watcher.queue.get().await.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn unknown_key_is_a_no_op() {
        let marker = Arc::new(RecordingMarker::new(false));
        let mut watcher = watcher(Arc::clone(&marker), vec![local_pv("pv-a", "n1")]);

        watcher.process_key("n-gone", Utc::now()).await;

        assert!(marker.recorded().is_empty());
    }
}
