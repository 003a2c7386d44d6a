//! Validated controller configuration, derived from the command line.
use crate::args::Arguments;
use crate::error::{self, Error, Result};
use models::node::{DrainerSettings, NodeConditionSpec};
use models::pod::PodFilterConfig;

use kube::config::{KubeConfigOptions, Kubeconfig};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

const ALL_INTERFACES: &str = "0.0.0.0";

#[derive(Clone, Debug)]
pub struct Settings {
    pub debug: bool,
    pub listen_address: SocketAddr,
    pub kubeconfig: Option<PathBuf>,
    pub master: Option<String>,
    pub dry_run: bool,
    pub drainer: DrainerSettings,
    pub drain_buffer: Duration,
    pub node_labels: BTreeMap<String, String>,
    pub pod_filters: PodFilterConfig,
    pub conditions: Vec<NodeConditionSpec>,
}

impl TryFrom<Arguments> for Settings {
    type Error = Error;

    fn try_from(args: Arguments) -> Result<Self> {
        ensure!(!args.node_conditions.is_empty(), error::NoConditionsSnafu);

        Ok(Settings {
            debug: args.debug,
            listen_address: resolve_listen_address(&args.listen)?,
            kubeconfig: args.kubeconfig,
            master: args.master,
            dry_run: args.dry_run,
            drainer: DrainerSettings {
                max_grace_period: args.max_grace_period,
                eviction_headroom: args.eviction_headroom,
            },
            drain_buffer: args.drain_buffer,
            node_labels: parse_node_labels(&args.node_label)?,
            pod_filters: PodFilterConfig {
                evict_daemonset_pods: args.evict_daemonset_pods,
                evict_local_storage_pods: args.evict_emptydir_pods,
                evict_unreplicated_pods: args.evict_unreplicated_pods,
                protected_annotations: args.protected_pod_annotation,
            },
            conditions: args.node_conditions,
        })
    }
}

impl Settings {
    /// Builds the Kubernetes client configuration.
    ///
    /// The kubeconfig file is used if given, then the API server address, and otherwise the in-cluster service
    /// account. An API server address always overrides the one found in a kubeconfig.
    pub async fn kube_config(&self) -> Result<kube::Config> {
        let master_url = self
            .master
            .as_ref()
            .map(|url| {
                url.parse::<http::Uri>()
                    .context(error::MasterUrlSnafu { url: url.clone() })
            })
            .transpose()?;

        let mut config = match (&self.kubeconfig, &master_url) {
            (Some(path), _) => {
                let kubeconfig =
                    Kubeconfig::read_from(path).context(error::ReadKubeconfigSnafu { path })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context(error::KubeconfigLoadSnafu)?
            }
            (None, Some(url)) => kube::Config::new(url.clone()),
            (None, None) => kube::Config::incluster().context(error::InClusterConfigSnafu)?,
        };

        if let Some(url) = master_url {
            config.cluster_url = url;
        }
        Ok(config)
    }
}

/// Resolves the address to serve on. An address with no host, like `:10002`, listens on all interfaces.
fn resolve_listen_address(address: &str) -> Result<SocketAddr> {
    let full_address = match address.strip_prefix(':') {
        Some(port) => format!("{}:{}", ALL_INTERFACES, port),
        None => address.to_string(),
    };

    full_address
        .to_socket_addrs()
        .context(error::ResolveListenAddressSnafu { address })?
        .next()
        .context(error::ListenAddressUnresolvedSnafu { address })
}

fn parse_node_labels(labels: &[String]) -> Result<BTreeMap<String, String>> {
    labels
        .iter()
        .map(|label| {
            label
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .context(error::InvalidNodeLabelSnafu { label })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use argh::FromArgs;
    use maplit::btreemap;

    fn settings_from(args: &[&str]) -> Result<Settings> {
        Settings::try_from(Arguments::from_args(&["node-drainer"], args).unwrap())
    }

    #[test]
    fn test_settings_from_args() {
        let settings = settings_from(&[
            "--node-label",
            "pool=gpu",
            "--evict-daemonset-pods",
            "--protected-pod-annotation",
            "example.com/protect=true",
            "KernelDeadlock",
        ])
        .unwrap();

        assert_eq!(
            settings.listen_address,
            "0.0.0.0:10002".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(settings.node_labels, btreemap! {"pool".to_string() => "gpu".to_string()});
        assert_eq!(
            settings.pod_filters,
            PodFilterConfig {
                evict_daemonset_pods: true,
                evict_local_storage_pods: false,
                evict_unreplicated_pods: false,
                protected_annotations: vec!["example.com/protect=true".to_string()],
            }
        );
        assert_eq!(settings.drainer, DrainerSettings::default());
        assert_eq!(settings.conditions.len(), 1);
    }

    #[test]
    fn test_explicit_listen_address() {
        let settings = settings_from(&["--listen", "127.0.0.1:9000", "Ready=Unknown"]).unwrap();
        assert_eq!(
            settings.listen_address,
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(settings_from(&[]), Err(Error::NoConditions)));
        assert!(matches!(
            settings_from(&["--node-label", "pool", "KernelDeadlock"]),
            Err(Error::InvalidNodeLabel { .. })
        ));
        assert!(matches!(
            settings_from(&["--node-label", "=gpu", "KernelDeadlock"]),
            Err(Error::InvalidNodeLabel { .. })
        ));
        assert!(settings_from(&["--listen", "not an address", "KernelDeadlock"]).is_err());
    }

    #[test]
    fn test_label_values_may_be_empty() {
        let labels = parse_node_labels(&["dedicated=".to_string()]).unwrap();
        assert_eq!(labels, btreemap! {"dedicated".to_string() => String::new()});
    }
}
