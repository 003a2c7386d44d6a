//! Decides which node notifications reach the drain scheduler.
//!
//! Filters run in a fixed order and the chain stops at the first filter that drops the node, so the cheapest and
//! most selective checks come first.
use crate::settings::Settings;
use models::node::{is_unschedulable, matching_condition, NodeConditionSpec};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Mutex;
use tracing::{event, Level};

/// A predicate over the current state of a node.
pub trait NodeFilter: Debug + Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &'static str;
    /// Returns `true` if the node should be passed on.
    fn evaluate(&self, node: &Node) -> bool;
    /// Discards any state the filter holds for the named node.
    fn forget(&self, _node_name: &str) {}
}

/// Keeps nodes carrying every one of the configured labels. An empty label set keeps every node.
#[derive(Debug, Default)]
pub struct LabelFilter {
    labels: BTreeMap<String, String>,
}

impl LabelFilter {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        LabelFilter { labels }
    }
}

impl NodeFilter for LabelFilter {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn evaluate(&self, node: &Node) -> bool {
        let node_labels = node.labels();
        self.labels
            .iter()
            .all(|(key, value)| node_labels.get(key) == Some(value))
    }
}

/// Keeps nodes matching at least one of the configured conditions.
#[derive(Debug)]
pub struct ConditionFilter {
    conditions: Vec<NodeConditionSpec>,
}

impl ConditionFilter {
    pub fn new(conditions: Vec<NodeConditionSpec>) -> Self {
        ConditionFilter { conditions }
    }
}

impl NodeFilter for ConditionFilter {
    fn name(&self) -> &'static str {
        "conditions"
    }

    fn evaluate(&self, node: &Node) -> bool {
        matching_condition(node, &self.conditions).is_some()
    }
}

/// Drops nodes that are already unschedulable.
#[derive(Debug, Default)]
pub struct SchedulableFilter;

impl NodeFilter for SchedulableFilter {
    fn name(&self) -> &'static str {
        "schedulable"
    }

    fn evaluate(&self, node: &Node) -> bool {
        !is_unschedulable(node)
    }
}

/// Keeps each node only the first time it is seen. Dry runs never cordon, so without this every notification
/// about an unhealthy node would be acted on again.
#[derive(Debug, Default)]
pub struct ProcessedFilter {
    processed: Mutex<HashSet<String>>,
}

impl NodeFilter for ProcessedFilter {
    fn name(&self) -> &'static str {
        "processed"
    }

    fn evaluate(&self, node: &Node) -> bool {
        let mut processed = self
            .processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        processed.insert(node.name_any())
    }

    fn forget(&self, node_name: &str) {
        self.processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(node_name);
    }
}

/// An ordered list of filters which a node must pass in full.
#[derive(Debug, Default)]
pub struct NodeFilterChain {
    filters: Vec<Box<dyn NodeFilter>>,
}

impl NodeFilterChain {
    pub fn new(filters: Vec<Box<dyn NodeFilter>>) -> Self {
        NodeFilterChain { filters }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut filters: Vec<Box<dyn NodeFilter>> = vec![
            Box::new(LabelFilter::new(settings.node_labels.clone())),
            Box::new(ConditionFilter::new(settings.conditions.clone())),
            Box::new(SchedulableFilter),
        ];
        if settings.dry_run {
            filters.push(Box::new(ProcessedFilter::default()));
        }
        NodeFilterChain { filters }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    pub fn evaluate(&self, node: &Node) -> bool {
        for filter in &self.filters {
            if !filter.evaluate(node) {
                event!(
                    Level::TRACE,
                    node = %node.name_any(),
                    filter = filter.name(),
                    "Node filtered out."
                );
                return false;
            }
        }
        true
    }

    pub fn forget(&self, node_name: &str) {
        for filter in &self.filters {
            filter.forget(node_name);
        }
    }
}
