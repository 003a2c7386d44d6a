use std::time::Duration;

/// Name under which the controller reports events and exports metrics.
pub const COMPONENT: &str = "draino";

// Defaults for the drain timing knobs.
pub const DEFAULT_MAX_GRACE_PERIOD: Duration = Duration::from_secs(8 * 60);
pub const DEFAULT_EVICTION_HEADROOM: Duration = Duration::from_secs(30);
pub const DEFAULT_DRAIN_BUFFER: Duration = Duration::from_secs(10 * 60);

/// Address at which `/metrics` and `/healthz` are served unless overridden.
pub const DEFAULT_LISTEN_ADDRESS: &str = ":10002";

pub const METRICS_ROUTE: &str = "/metrics";
pub const HEALTH_CHECK_ROUTE: &str = "/healthz";

/// The condition status a `TYPE` spec expects when no `=STATE` is given.
pub const CONDITION_STATUS_TRUE: &str = "True";

// Well-known pod metadata.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const DAEMONSET_KIND: &str = "DaemonSet";
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
pub const POD_PHASE_FAILED: &str = "Failed";

// Reasons attached to the cluster events recorded against nodes.
pub const EVENT_REASON_CORDON_SUCCEEDED: &str = "CordonSucceeded";
pub const EVENT_REASON_CORDON_FAILED: &str = "CordonFailed";
pub const EVENT_REASON_DRAIN_SUCCEEDED: &str = "DrainSucceeded";
pub const EVENT_REASON_DRAIN_FAILED: &str = "DrainFailed";

// Values of the `result` attribute on cordon and drain metrics.
pub const RESULT_SUCCEEDED: &str = "succeeded";
pub const RESULT_FAILED: &str = "failed";
