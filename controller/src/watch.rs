//! Feeds node notifications from the cluster into the drain scheduler.
use crate::error::{self, Result};
use crate::runner::Shutdown;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tracing::{event, Level};

/// A change to the set of nodes in the cluster, in the order it was observed.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A node was added or modified.
    Applied(Node),
    /// A node was removed from the cluster.
    Deleted(Node),
    /// The watch was re-established; these are all of the nodes that currently exist.
    Restarted(Vec<Node>),
}

impl From<watcher::Event<Node>> for NodeEvent {
    fn from(event: watcher::Event<Node>) -> Self {
        match event {
            watcher::Event::Applied(node) => NodeEvent::Applied(node),
            watcher::Event::Deleted(node) => NodeEvent::Deleted(node),
            watcher::Event::Restarted(nodes) => NodeEvent::Restarted(nodes),
        }
    }
}

/// Watches every node in the cluster and forwards changes to `sender` until shutdown.
pub async fn watch_nodes(
    k8s_client: kube::Client,
    sender: mpsc::Sender<NodeEvent>,
    shutdown: Shutdown,
) -> Result<()> {
    let nodes: Api<Node> = Api::all(k8s_client);
    let stream = watcher(nodes, watcher::Config::default()).default_backoff();
    forward_events(stream, sender, shutdown).await
}

pub(crate) async fn forward_events<S>(
    stream: S,
    sender: mpsc::Sender<NodeEvent>,
    shutdown: Shutdown,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<Node>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    loop {
        let next = tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let event = NodeEvent::from(event);
                if let NodeEvent::Applied(node) | NodeEvent::Deleted(node) = &event {
                    event!(
                        Level::TRACE,
                        node = %node.name_any(),
                        "Processed a k8s event for a Node object."
                    );
                }
                if sender.send(event).await.is_err() {
                    event!(Level::INFO, "Node event receiver closed, stopping watch.");
                    return Ok(());
                }
            }
            Some(Err(err)) => {
                // The watcher backs off and resumes by itself.
                event!(Level::WARN, "Error watching nodes: '{}'", err);
            }
            None => {
                return error::KubernetesWatcherFailedSnafu {
                    object: "Node".to_string(),
                }
                .fail();
            }
        }
    }
}
