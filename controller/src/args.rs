//! The command-line surface of the `node-drainer` binary.
use models::constants::{
    DEFAULT_DRAIN_BUFFER, DEFAULT_EVICTION_HEADROOM, DEFAULT_LISTEN_ADDRESS,
    DEFAULT_MAX_GRACE_PERIOD,
};
use models::node::NodeConditionSpec;

use argh::FromArgs;
use std::path::PathBuf;
use std::time::Duration;

/// Automatically cordons and drains nodes that match the supplied conditions.
#[derive(FromArgs, Debug)]
pub struct Arguments {
    /// run with debug logging
    #[argh(switch, short = 'd')]
    pub debug: bool,

    /// address at which to expose /metrics and /healthz
    #[argh(option, default = "DEFAULT_LISTEN_ADDRESS.to_string()")]
    pub listen: String,

    /// kubeconfig to use for connecting to the Kubernetes API server
    #[argh(option)]
    pub kubeconfig: Option<PathBuf>,

    /// address of the Kubernetes API server, overriding any value in the kubeconfig
    #[argh(option)]
    pub master: Option<String>,

    /// emit cluster events without actually cordoning or draining matching nodes
    #[argh(switch)]
    pub dry_run: bool,

    /// maximum time evicted pods will be given to terminate gracefully
    #[argh(
        option,
        default = "DEFAULT_MAX_GRACE_PERIOD",
        from_str_fn(parse_duration)
    )]
    pub max_grace_period: Duration,

    /// additional time to wait after a pod's termination grace period for it to have been deleted
    #[argh(
        option,
        default = "DEFAULT_EVICTION_HEADROOM",
        from_str_fn(parse_duration)
    )]
    pub eviction_headroom: Duration,

    /// minimum time between starting successive drains
    #[argh(option, default = "DEFAULT_DRAIN_BUFFER", from_str_fn(parse_duration))]
    pub drain_buffer: Duration,

    /// only nodes with this KEY=VALUE label will be cordoned and drained; may be repeated
    #[argh(option)]
    pub node_label: Vec<String>,

    /// evict pods managed by DaemonSets
    #[argh(switch)]
    pub evict_daemonset_pods: bool,

    /// evict pods with local storage, i.e. with emptyDir volumes
    #[argh(switch)]
    pub evict_emptydir_pods: bool,

    /// evict pods that were not created by a replication controller
    #[argh(switch)]
    pub evict_unreplicated_pods: bool,

    /// protect pods with this annotation from eviction, as KEY or KEY=VALUE; may be repeated
    #[argh(option)]
    pub protected_pod_annotation: Vec<String>,

    /// nodes for which any of these conditions are true will be cordoned and drained, as TYPE[=STATE]
    #[argh(positional)]
    pub node_conditions: Vec<NodeConditionSpec>,
}

/// Parses a duration such as `500ms`, `30s`, `8m` or `1h30m`. A bare `0` is also accepted.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|err| {
        format!(
            "invalid duration '{}': {}, expected e.g. 30s, 8m or 1h30m",
            value, err
        )
    })
}
