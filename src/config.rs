use lazy_static::lazy_static;
use std::collections::HashSet;
use std::time::Duration;

// Failure-mark annotation keys. Consumers key off presence, not value.
pub const HOST_PATH_NOT_EXIST: &str = "HostPathNotExist";
pub const MIS_MATCHED_VOL_SIZE: &str = "MisMatchedVolSize";
pub const NOT_MOUNT_POINT: &str = "NotMountPoint";
pub const NODE_FAILURE: &str = "NodeFailure";
pub const FIRST_MARK_TIME: &str = "FirstMarkTime";

// Event reasons emitted alongside the annotations.
pub const MARK_PV_SUCCEEDED: &str = "MarkPVSucceeded";
pub const MARK_PV_FAILED: &str = "MarkPVFailed";

/// Legacy annotation carrying a JSON-encoded NodeAffinity on a PV.
pub const ALPHA_NODE_AFFINITY_ANNOTATION: &str = "volume.alpha.kubernetes.io/node-affinity";

/// ConfigMap mount point for the monitor's own configuration.
pub const MONITOR_CONFIG_PATH: &str = "/etc/monitor/config/";
/// ConfigMap mount point of the local-volume provisioner configuration we consume.
pub const PROVISIONER_CONFIG_PATH: &str = "/etc/provisioner/config/";

/// Environment variable binding a node-local agent to its Node.
pub const NODE_NAME_ENV: &str = "MY_NODE_NAME";

pub const UPDATE_PV_RETRY_COUNT: usize = 5;
pub const UPDATE_PV_INTERVAL: Duration = Duration::from_millis(5);

/// Period at which watch drivers re-list their resource into the caches.
pub const DEFAULT_INFORMER_RESYNC_PERIOD: Duration = Duration::from_secs(15);
/// Period at which the evaluators walk their cache snapshots.
pub const DEFAULT_MONITOR_RESYNC_PERIOD: Duration = Duration::from_secs(30);
/// How long a node may stay NotReady before it is considered broken.
pub const DEFAULT_NODE_NOT_READY_DURATION: Duration = Duration::from_secs(120);
/// Delay before a grace-pending node is re-enqueued for another look.
pub const NODE_RECHECK_DELAY: Duration = Duration::from_secs(10);

// Storage types selectable via --kube-storage-types.
pub const LOCAL_PV_TYPE: &str = "local_pv";
pub const CINDER_PV_TYPE: &str = "cinder_pv";
pub const HOSTPATH_PV_TYPE: &str = "hostpath_pv";

lazy_static! {
    pub static ref SUPPORTED_STORAGE_TYPES: HashSet<&'static str> =
        HashSet::from([LOCAL_PV_TYPE, CINDER_PV_TYPE, HOSTPATH_PV_TYPE]);
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
