mod client;
mod drain;
mod error;

pub use self::client::*;
pub use self::drain::{error::DrainError, error::EvictionError, DrainReport, PodOutcome};
pub use self::error::Error as CordonDrainError;

use crate::constants::CONDITION_STATUS_TRUE;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use lazy_static::lazy_static;
use snafu::{OptionExt, Snafu};

use std::fmt;
use std::str::FromStr;

lazy_static! {
    // TYPE[=STATE], where neither part may contain whitespace or a further '='.
    static ref CONDITION_SPEC_RE: regex::Regex =
        regex::Regex::new(r"^([^=\s]+)(?:=([^=\s]+))?$").expect("Invalid regex literal.");
}

/// A node condition that marks a node as needing to be drained, e.g. `KernelDeadlock` or `Ready=Unknown`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeConditionSpec {
    /// The condition type, e.g. `KernelDeadlock`.
    pub condition_type: String,
    /// The status the condition must have to match. Defaults to `True`.
    pub status: String,
}

impl NodeConditionSpec {
    pub fn new<S1: Into<String>, S2: Into<String>>(condition_type: S1, status: S2) -> Self {
        NodeConditionSpec {
            condition_type: condition_type.into(),
            status: status.into(),
        }
    }

    pub fn matches(&self, condition: &NodeCondition) -> bool {
        condition.type_ == self.condition_type && condition.status == self.status
    }
}

impl FromStr for NodeConditionSpec {
    type Err = ConditionSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let captures = CONDITION_SPEC_RE
            .captures(spec)
            .context(ConditionSpecSnafu { spec })?;
        Ok(NodeConditionSpec {
            condition_type: captures[1].to_string(),
            status: captures
                .get(2)
                .map_or(CONDITION_STATUS_TRUE, |status| status.as_str())
                .to_string(),
        })
    }
}

impl fmt::Display for NodeConditionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.condition_type, self.status)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Invalid node condition '{}', expected TYPE[=STATE]", spec))]
pub struct ConditionSpecError {
    spec: String,
}

/// Returns the first condition on the node matched by any of the specs.
pub fn matching_condition<'a>(
    node: &'a Node,
    specs: &[NodeConditionSpec],
) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| specs.iter().any(|spec| spec.matches(condition)))
        })
}

/// When the node last transitioned into a condition matched by the specs.
pub fn unhealthy_since(node: &Node, specs: &[NodeConditionSpec]) -> Option<DateTime<Utc>> {
    matching_condition(node, specs)
        .and_then(|condition| condition.last_transition_time.as_ref())
        .map(|time| time.0)
}

/// Whether the node is already marked unschedulable.
pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}
