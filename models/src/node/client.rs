use super::drain::{self, DrainReport, DrainSettings};
use super::error::{self, Result};
use super::is_unschedulable;
use crate::cluster::{ClusterClient, ClusterError};
use crate::constants::{DEFAULT_EVICTION_HEADROOM, DEFAULT_MAX_GRACE_PERIOD};
use crate::pod::PodFilterSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_retry::RetryIf;
use tracing::{event, instrument, Level};

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

// How long transient failures to read or cordon a node are retried. A failure after that is left for the next
// notification about the node.
const CORDON_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// What a cordon request did to the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CordonOutcome {
    /// The node was marked unschedulable.
    Cordoned,
    /// The node was already unschedulable; nothing was changed.
    AlreadyCordoned,
    /// The node no longer exists.
    NodeGone,
    /// Dry-run: no request was made.
    Simulated,
}

#[async_trait]
/// A trait providing an interface to cordon and drain nodes. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait CordonDrainer: Clone + Sized + Send + Sync {
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon(&self, node: &Node) -> Result<CordonOutcome>;
    /// Evicts all eligible pods on the given node.
    async fn drain(&self, node: &Node) -> Result<DrainReport>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock CordonDrainer for use in tests.
    pub CordonDrainer {}
    #[async_trait]
    impl CordonDrainer for CordonDrainer {
        async fn cordon(&self, node: &Node) -> Result<CordonOutcome>;
        async fn drain(&self, node: &Node) -> Result<DrainReport>;
    }

    impl Clone for CordonDrainer {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> CordonDrainer for Arc<T>
where
    T: CordonDrainer,
{
    async fn cordon(&self, node: &Node) -> Result<CordonOutcome> {
        (**self).cordon(node).await
    }

    async fn drain(&self, node: &Node) -> Result<DrainReport> {
        (**self).drain(node).await
    }
}

/// Timing limits applied to every drain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DrainerSettings {
    /// The longest termination grace period granted to an evicted Pod.
    pub max_grace_period: Duration,
    /// Extra time allowed on top of the grace period for evictions to be accepted and Pods to disappear.
    pub eviction_headroom: Duration,
}

impl Default for DrainerSettings {
    fn default() -> Self {
        DrainerSettings {
            max_grace_period: DEFAULT_MAX_GRACE_PERIOD,
            eviction_headroom: DEFAULT_EVICTION_HEADROOM,
        }
    }
}

#[derive(Clone)]
/// Concrete implementation of the `CordonDrainer` trait which cordons and evicts through the cluster API.
pub struct APICordonDrainer<C: ClusterClient> {
    client: C,
    settings: DrainerSettings,
    pod_filters: Arc<PodFilterSet>,
}

impl<C: ClusterClient> APICordonDrainer<C> {
    pub fn new(client: C, settings: DrainerSettings, pod_filters: PodFilterSet) -> Self {
        APICordonDrainer {
            client,
            settings,
            pod_filters: Arc::new(pod_filters),
        }
    }

    fn drain_settings(&self) -> DrainSettings<'_> {
        DrainSettings {
            max_grace_period: self.settings.max_grace_period,
            eviction_headroom: self.settings.eviction_headroom,
            pod_filters: self.pod_filters.as_ref(),
        }
    }
}

fn node_name(node: &Node) -> Result<&str> {
    node.metadata
        .name
        .as_deref()
        .context(error::NodeWithoutNameSnafu)
}

#[async_trait]
impl<C: ClusterClient> CordonDrainer for APICordonDrainer<C> {
    /// The live node is re-read before cordoning so that repeated requests only mutate it once.
    #[instrument(skip(self, node), fields(node = %node.name_any()), err)]
    async fn cordon(&self, node: &Node) -> Result<CordonOutcome> {
        let node_name = node_name(node)?;
        let deadline = Instant::now() + CORDON_RETRY_WINDOW;
        let retry_strategy = || drain::retry_until(deadline);
        let should_retry = |err: &ClusterError| err.should_retry();

        let live_node = match RetryIf::spawn(
            retry_strategy(),
            || self.client.get_node(node_name),
            should_retry,
        )
        .await
        {
            Ok(live_node) => live_node,
            Err(ClusterError::NotFound { .. }) => {
                event!(Level::INFO, "Node '{}' is gone, not cordoning.", node_name);
                return Ok(CordonOutcome::NodeGone);
            }
            Err(err) => return Err(err).context(error::CordonNodeSnafu { node_name }),
        };

        if is_unschedulable(&live_node) {
            event!(Level::INFO, "Node '{}' is already cordoned.", node_name);
            return Ok(CordonOutcome::AlreadyCordoned);
        }

        match RetryIf::spawn(
            retry_strategy(),
            || self.client.cordon_node(node_name),
            should_retry,
        )
        .await
        {
            Ok(()) => {
                event!(Level::INFO, "Cordoned Node '{}'.", node_name);
                Ok(CordonOutcome::Cordoned)
            }
            Err(ClusterError::NotFound { .. }) => Ok(CordonOutcome::NodeGone),
            Err(err) => Err(err).context(error::CordonNodeSnafu { node_name }),
        }
    }

    #[instrument(skip(self, node), fields(node = %node.name_any()), err)]
    async fn drain(&self, node: &Node) -> Result<DrainReport> {
        let node_name = node_name(node)?;
        drain::drain_node(&self.client, node_name, &self.drain_settings())
            .await
            .context(error::DrainNodeSnafu { node_name })
    }
}

#[derive(Clone, Debug, Default)]
/// A `CordonDrainer` which only logs what it would do. Used for dry runs.
pub struct NoopCordonDrainer {}

#[async_trait]
impl CordonDrainer for NoopCordonDrainer {
    async fn cordon(&self, node: &Node) -> Result<CordonOutcome> {
        event!(
            Level::INFO,
            node = %node.name_any(),
            "Dry run: would have cordoned node."
        );
        Ok(CordonOutcome::Simulated)
    }

    async fn drain(&self, node: &Node) -> Result<DrainReport> {
        event!(
            Level::INFO,
            node = %node.name_any(),
            "Dry run: would have drained node."
        );
        Ok(DrainReport::default())
    }
}
