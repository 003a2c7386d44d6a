use snafu::Snafu;
use std::path::PathBuf;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("At least one node condition must be specified."))]
    NoConditions,

    #[snafu(display("Invalid node label '{}', expected KEY=VALUE", label))]
    InvalidNodeLabel { label: String },

    #[snafu(display("Unable to resolve listen address '{}': '{}'", address, source))]
    ResolveListenAddress {
        source: std::io::Error,
        address: String,
    },

    #[snafu(display("Listen address '{}' did not resolve to any socket address.", address))]
    ListenAddressUnresolved { address: String },

    #[snafu(display("Unable to read kubeconfig '{}': '{}'", path.display(), source))]
    ReadKubeconfig {
        source: kube::config::KubeconfigError,
        path: PathBuf,
    },

    #[snafu(display("Unable to create Kubernetes client config from kubeconfig: '{}'", source))]
    KubeconfigLoad {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Invalid Kubernetes API server address '{}': '{}'", url, source))]
    MasterUrl {
        source: http::uri::InvalidUri,
        url: String,
    },

    #[snafu(display("Unable to create in-cluster Kubernetes client config: '{}'", source))]
    InClusterConfig {
        source: kube::config::InClusterError,
    },

    #[snafu(display("The Kubernetes WATCH on {} objects has failed.", object))]
    KubernetesWatcherFailed { object: String },

    #[snafu(display("Unable to create prometheus exporter: '{}'", source))]
    PrometheusExporter {
        source: opentelemetry::metrics::MetricsError,
    },

    #[snafu(display("Error running prometheus HTTP server: '{}'", source))]
    PrometheusServerError { source: std::io::Error },

    #[snafu(display("Unable to listen for termination signals: '{}'", source))]
    SignalHandler { source: std::io::Error },
}
