//! The subset of the Kubernetes API used to cordon and drain nodes.
//!
//! The drain logic is written against the `ClusterClient` trait so that it can be exercised against mocks,
//! and every API failure is classified into a `ClusterError` so callers can decide whether to retry.
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{DeleteParams, EvictParams, ListParams},
    Api,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub use error::ClusterError;

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

type Result<T> = std::result::Result<T, ClusterError>;

#[async_trait]
/// A trait providing an interface to the node and pod APIs of a cluster. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait ClusterClient: Clone + Sized + Send + Sync {
    /// Fetches the current state of a node.
    async fn get_node(&self, node_name: &str) -> Result<Node>;
    /// Marks the node as unschedulable.
    async fn cordon_node(&self, node_name: &str) -> Result<()>;
    /// Lists every pod bound to the node.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    /// Creates an eviction for the pod, asking for the given termination grace period.
    async fn evict_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period: Option<Duration>,
    ) -> Result<()>;
    /// Fetches the current state of a pod.
    async fn get_pod(&self, namespace: &str, pod_name: &str) -> Result<Pod>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn get_node(&self, node_name: &str) -> Result<Node>;
        async fn cordon_node(&self, node_name: &str) -> Result<()>;
        async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn evict_pod(
            &self,
            namespace: &str,
            pod_name: &str,
            grace_period: Option<Duration>,
        ) -> Result<()>;
        async fn get_pod(&self, namespace: &str, pod_name: &str) -> Result<Pod>;
    }

    impl Clone for ClusterClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ClusterClient for Arc<T>
where
    T: ClusterClient,
{
    async fn get_node(&self, node_name: &str) -> Result<Node> {
        (**self).get_node(node_name).await
    }

    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        (**self).cordon_node(node_name).await
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        (**self).list_pods_on_node(node_name).await
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period: Option<Duration>,
    ) -> Result<()> {
        (**self).evict_pod(namespace, pod_name, grace_period).await
    }

    async fn get_pod(&self, namespace: &str, pod_name: &str) -> Result<Pod> {
        (**self).get_pod(namespace, pod_name).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ClusterClient` trait backed by the Kubernetes API.
pub struct K8SClusterClient {
    k8s_client: kube::Client,
}

impl K8SClusterClient {
    pub fn new(k8s_client: kube::Client) -> Self {
        K8SClusterClient { k8s_client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.k8s_client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for K8SClusterClient {
    #[instrument(skip(self), err)]
    async fn get_node(&self, node_name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .get(node_name)
            .await
            .map_err(|err| ClusterError::from_kube(err, "Node", node_name))
    }

    #[instrument(skip(self), err)]
    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .cordon(node_name)
            .await
            .map_err(|err| ClusterError::from_kube(err, "Node", node_name))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        let list_params =
            ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = pods
            .list(&list_params)
            .await
            .map_err(|err| ClusterError::from_kube(err, "Node", node_name))?;
        Ok(pods.items)
    }

    #[instrument(skip(self), err)]
    async fn evict_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period: Option<Duration>,
    ) -> Result<()> {
        let evict_params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: grace_period
                    .map(|grace| u32::try_from(grace.as_secs()).unwrap_or(u32::MAX)),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pods(namespace)
            .evict(pod_name, &evict_params)
            .await
            .map_err(|err| ClusterError::from_kube(err, "Pod", pod_name))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_pod(&self, namespace: &str, pod_name: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(pod_name)
            .await
            .map_err(|err| ClusterError::from_kube(err, "Pod", pod_name))
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum ClusterError {
        #[snafu(display("{} '{}' does not exist.", kind, name))]
        /// The object is gone. Callers acting on it generally have nothing left to do.
        NotFound { kind: String, name: String },

        #[snafu(display(
            "Too many requests for {} '{}', likely due to a PodDisruptionBudget: '{}'",
            kind,
            name,
            source
        ))]
        /// The API server asked us to back off. For evictions this means a disruption budget would be violated.
        TooManyRequests {
            source: kube::Error,
            kind: String,
            name: String,
        },

        #[snafu(display("Transient error while operating on {} '{}': '{}'", kind, name, source))]
        /// Conflicts, server-side errors and connection failures, all of which may succeed on retry.
        Transient {
            source: kube::Error,
            kind: String,
            name: String,
        },

        #[snafu(display("Request for {} '{}' was rejected: '{}'", kind, name, source))]
        /// Any other failure. Retrying will not help.
        Rejected {
            source: kube::Error,
            kind: String,
            name: String,
        },
    }

    impl ClusterError {
        /// Classifies an error returned by `kube`.
        pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
            let kind = kind.to_string();
            let name = name.to_string();
            match &err {
                kube::Error::Api(response) => match response.code {
                    404 => Self::NotFound { kind, name },
                    429 => Self::TooManyRequests {
                        source: err,
                        kind,
                        name,
                    },
                    409 | 500..=599 => Self::Transient {
                        source: err,
                        kind,
                        name,
                    },
                    _ => Self::Rejected {
                        source: err,
                        kind,
                        name,
                    },
                },
                kube::Error::HyperError(_) | kube::Error::Service(_) => Self::Transient {
                    source: err,
                    kind,
                    name,
                },
                _ => Self::Rejected {
                    source: err,
                    kind,
                    name,
                },
            }
        }

        pub fn is_not_found(&self) -> bool {
            matches!(self, Self::NotFound { .. })
        }

        pub fn is_too_many_requests(&self) -> bool {
            matches!(self, Self::TooManyRequests { .. })
        }

        /// Whether the same request may succeed if attempted again later.
        pub fn should_retry(&self) -> bool {
            matches!(
                self,
                Self::TooManyRequests { .. } | Self::Transient { .. }
            )
        }
    }
}
