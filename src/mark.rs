use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::{Api, PostParams};
use kube::runtime::events::{Event as ClusterEvent, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::config::{FIRST_MARK_TIME, MARK_PV_FAILED, MARK_PV_SUCCEEDED, UPDATE_PV_INTERVAL, UPDATE_PV_RETRY_COUNT};
use crate::ext::MonitorResourceExt;
use crate::volume_map::VolumeMap;

/// Records a failure-reason annotation on a PV. The single mutating
/// operation this system performs against the cluster.
#[async_trait]
pub trait VolumeMarker: Send + Sync {
    async fn mark(&self, pv: &PersistentVolume, reason: &str, value: &str) -> kube::Result<()>;
}

/// Seam over the PV update call so the engine can be exercised without a
/// cluster.
#[async_trait]
pub trait VolumeUpdateApi: Send + Sync {
    async fn update_volume(&self, pv: &PersistentVolume) -> kube::Result<PersistentVolume>;
}

/// Seam over event emission. Emission failures are logged by the
/// implementation and never affect the mark outcome.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, pv: &PersistentVolume, event_type: EventType, reason: &str, note: String);
}

/// The idempotent annotation writer.
///
/// A mark that is already present is a success without a write and without an
/// event; otherwise the annotation (and `FirstMarkTime`, if absent) is added
/// to a copy of the observed PV and the update is retried on transient
/// failures. Exactly one terminal event is emitted per invocation.
pub struct MarkEngine {
    api: Box<dyn VolumeUpdateApi>,
    events: Box<dyn EventSink>,
    /// Cache to refresh with the post-image after a successful update.
    volume_map: Option<Arc<VolumeMap>>,
}

impl MarkEngine {
    pub fn new(
        api: Box<dyn VolumeUpdateApi>,
        events: Box<dyn EventSink>,
        volume_map: Option<Arc<VolumeMap>>,
    ) -> Self {
        MarkEngine { api, events, volume_map }
    }

    /// Creates a cluster-backed engine emitting events as `component`.
    pub fn with_client(
        client: Client,
        component: String,
        volume_map: Option<Arc<VolumeMap>>,
    ) -> Self {
        MarkEngine::new(
            Box::new(KubeVolumeApi::new(client.clone())),
            Box::new(RecorderSink::new(client, component)),
            volume_map,
        )
    }
}

#[async_trait]
impl VolumeMarker for MarkEngine {
    async fn mark(&self, pv: &PersistentVolume, reason: &str, value: &str) -> kube::Result<()> {
        if pv.has_annotation(reason) {
            return Ok(());
        }

        let mut volume = pv.clone();
        let annotations = volume.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(reason.to_string(), value.to_string());
        if !annotations.contains_key(FIRST_MARK_TIME) {
            annotations.insert(FIRST_MARK_TIME.to_string(), Utc::now().to_string());
        }

        let mut attempts = 0;
        loop {
            match self.api.update_volume(&volume).await {
                Ok(updated) => {
                    if let Some(volume_map) = &self.volume_map {
                        volume_map.add_or_update(&updated);
                    }
                    self.events
                        .emit(
                            pv,
                            EventType::Normal,
                            MARK_PV_SUCCEEDED,
                            format!("Marked PV {} with annotation key {}", pv.display_name(), reason),
                        )
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= UPDATE_PV_RETRY_COUNT {
                        self.events
                            .emit(
                                pv,
                                EventType::Warning,
                                MARK_PV_FAILED,
                                format!(
                                    "Failed to mark PV {} with annotation key {}: {}",
                                    pv.display_name(),
                                    reason,
                                    e
                                ),
                            )
                            .await;
                        return Err(e);
                    }
                    tokio::time::sleep(UPDATE_PV_INTERVAL).await;
                }
            }
        }
    }
}

struct KubeVolumeApi {
    api: Api<PersistentVolume>,
}

impl KubeVolumeApi {
    fn new(client: Client) -> Self {
        KubeVolumeApi { api: Api::all(client) }
    }
}

#[async_trait]
impl VolumeUpdateApi for KubeVolumeApi {
    async fn update_volume(&self, pv: &PersistentVolume) -> kube::Result<PersistentVolume> {
        self.api.replace(&pv.name_any(), &PostParams::default(), pv).await
    }
}

struct RecorderSink {
    client: Client,
    reporter: Reporter,
}

impl RecorderSink {
    fn new(client: Client, component: String) -> Self {
        RecorderSink {
            client,
            reporter: Reporter { controller: component, instance: None },
        }
    }
}

#[async_trait]
impl EventSink for RecorderSink {
    async fn emit(&self, pv: &PersistentVolume, event_type: EventType, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), pv.object_ref(&()));
        let event = ClusterEvent {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: "Mark".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("Failed to emit {} event for PV {}: {}", reason, pv.display_name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HOST_PATH_NOT_EXIST, NODE_FAILURE};
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    fn pv(name: &str) -> PersistentVolume {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some(name.into());
        pv.metadata.resource_version = Some("1".into());
        pv
    }

    fn conflict() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        })
    }

    /// Fails the first `fail_first` updates with a conflict, then succeeds
    /// and returns the input with a bumped resource version.
    struct FakeApi {
        attempts: AtomicUsize,
        fail_first: usize,
        updates: Mutex<Vec<PersistentVolume>>,
    }

    impl FakeApi {
        fn new(fail_first: usize) -> Self {
            FakeApi { attempts: AtomicUsize::new(0), fail_first, updates: Mutex::new(Vec::new()) }
        }

        fn attempt_count(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VolumeUpdateApi for FakeApi {
        async fn update_volume(&self, pv: &PersistentVolume) -> kube::Result<PersistentVolume> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(conflict());
            }
            let mut updated = pv.clone();
            updated.metadata.resource_version = Some("2".into());
            self.updates.lock().unwrap().push(updated.clone());
            Ok(updated)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        events: Mutex<Vec<(String, bool)>>,
    }

    impl FakeSink {
        fn recorded(&self) -> Vec<(String, bool)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for FakeSink {
        async fn emit(&self, _pv: &PersistentVolume, event_type: EventType, reason: &str, _note: String) {
            let warning = matches!(event_type, EventType::Warning);
            self.events.lock().unwrap().push((reason.to_string(), warning));
        }
    }

    fn engine(
        fail_first: usize,
        volume_map: Option<Arc<VolumeMap>>,
    ) -> (MarkEngine, Arc<FakeApi>, Arc<FakeSink>) {
        let api = Arc::new(FakeApi::new(fail_first));
        let sink = Arc::new(FakeSink::default());

        struct SharedApi(Arc<FakeApi>);
        #[async_trait]
        impl VolumeUpdateApi for SharedApi {
            async fn update_volume(&self, pv: &PersistentVolume) -> kube::Result<PersistentVolume> {
                self.0.update_volume(pv).await
            }
        }
        struct SharedSink(Arc<FakeSink>);
        #[async_trait]
        impl EventSink for SharedSink {
            async fn emit(&self, pv: &PersistentVolume, t: EventType, r: &str, n: String) {
                self.0.emit(pv, t, r, n).await
            }
        }

        let engine = MarkEngine::new(
            Box::new(SharedApi(Arc::clone(&api))),
            Box::new(SharedSink(Arc::clone(&sink))),
            volume_map,
        );
        (engine, api, sink)
    }

    #[tokio::test]
    async fn mark_adds_annotation_and_first_mark_time() {
        let volume_map = Arc::new(VolumeMap::new());
        let (engine, api, sink) = engine(0, Some(Arc::clone(&volume_map)));

        engine.mark(&pv("pv-a"), HOST_PATH_NOT_EXIST, "yes").await.unwrap();

        let updates = api.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        let annotations = updates[0].metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(HOST_PATH_NOT_EXIST).map(String::as_str), Some("yes"));
        assert!(annotations.contains_key(FIRST_MARK_TIME));

        // post-image lands in the cache, one success event is recorded
        assert!(volume_map.get("pv-a").unwrap().has_annotation(HOST_PATH_NOT_EXIST));
        assert_eq!(sink.recorded(), vec![(MARK_PV_SUCCEEDED.to_string(), false)]);
    }

    #[tokio::test]
    async fn mark_is_idempotent_for_present_annotation() {
        let (engine, api, sink) = engine(0, None);
        let mut marked = pv("pv-a");
        marked.metadata.annotations = Some(
            [
                (HOST_PATH_NOT_EXIST.to_string(), "yes".to_string()),
                (FIRST_MARK_TIME.to_string(), "2026-01-01 00:00:00 UTC".to_string()),
            ]
            .into(),
        );

        engine.mark(&marked, HOST_PATH_NOT_EXIST, "yes").await.unwrap();

        assert_eq!(api.attempt_count(), 0);
        assert!(sink.recorded().is_empty());
    }

    #[tokio::test]
    async fn marking_twice_through_the_cache_updates_once() {
        let volume_map = Arc::new(VolumeMap::new());
        let (engine, api, sink) = engine(0, Some(Arc::clone(&volume_map)));

        engine.mark(&pv("pv-a"), HOST_PATH_NOT_EXIST, "yes").await.unwrap();
        let observed = volume_map.get("pv-a").unwrap();
        engine.mark(&observed, HOST_PATH_NOT_EXIST, "yes").await.unwrap();

        assert_eq!(api.attempt_count(), 1);
        assert_eq!(sink.recorded().len(), 1);
    }

    #[tokio::test]
    async fn first_mark_time_is_not_restamped_for_new_reasons() {
        let (engine, api, _sink) = engine(0, None);
        let mut marked = pv("pv-a");
        marked.metadata.annotations = Some(
            [
                (HOST_PATH_NOT_EXIST.to_string(), "yes".to_string()),
                (FIRST_MARK_TIME.to_string(), "2026-01-01 00:00:00 UTC".to_string()),
            ]
            .into(),
        );

        engine.mark(&marked, NODE_FAILURE, "true").await.unwrap();

        let updates = api.updates.lock().unwrap();
        let annotations = updates[0].metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get(FIRST_MARK_TIME).map(String::as_str),
            Some("2026-01-01 00:00:00 UTC")
        );
        assert_eq!(annotations.get(NODE_FAILURE).map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let volume_map = Arc::new(VolumeMap::new());
        let (engine, api, sink) = engine(3, Some(Arc::clone(&volume_map)));

        let start = Instant::now();
        engine.mark(&pv("pv-a"), HOST_PATH_NOT_EXIST, "yes").await.unwrap();

        // three conflicts sleep three times before the fourth attempt lands
        assert!(start.elapsed() >= UPDATE_PV_INTERVAL * 3);
        assert_eq!(api.attempt_count(), 4);
        assert_eq!(api.updates.lock().unwrap().len(), 1);
        assert_eq!(sink.recorded(), vec![(MARK_PV_SUCCEEDED.to_string(), false)]);
        assert!(volume_map.get("pv-a").is_some());
    }

    #[tokio::test]
    async fn retry_exhaustion_emits_one_warning() {
        let (engine, api, sink) = engine(usize::MAX, None);

        let result = engine.mark(&pv("pv-a"), HOST_PATH_NOT_EXIST, "yes").await;

        assert!(result.is_err());
        assert_eq!(api.attempt_count(), UPDATE_PV_RETRY_COUNT);
        assert_eq!(sink.recorded(), vec![(MARK_PV_FAILED.to_string(), true)]);
    }
}
