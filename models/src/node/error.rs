use super::drain::error::DrainError;
use super::DrainReport;
use crate::cluster::ClusterError;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to cordon Node '{}': '{}'", node_name, source))]
    CordonNode {
        source: ClusterError,
        node_name: String,
    },

    #[snafu(display("Unable to drain Node '{}': '{}'", node_name, source))]
    DrainNode {
        source: DrainError,
        node_name: String,
    },

    #[snafu(display("Node object is missing a name."))]
    NodeWithoutName,
}

impl Error {
    /// Per-Pod results for a drain that got as far as evicting.
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            Self::DrainNode { source, .. } => source.report(),
            _ => None,
        }
    }
}
