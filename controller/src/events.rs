//! Publishes Kubernetes events against the nodes being cordoned and drained.
use models::constants::COMPONENT;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(test)]
use mockall::mock;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl From<EventSeverity> for EventType {
    fn from(severity: EventSeverity) -> Self {
        match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        }
    }
}

#[async_trait]
/// A trait providing an interface to publish cluster events about nodes. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
///
/// Publishing is best-effort: failures are logged and never affect the drain itself.
pub trait EventRecorder: Clone + Sized + Send + Sync {
    async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, note: String);
}

#[cfg(test)]
mock! {
    /// A Mock EventRecorder for use in tests.
    pub EventRecorder {}
    #[async_trait]
    impl EventRecorder for EventRecorder {
        async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, note: String);
    }

    impl Clone for EventRecorder {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> EventRecorder for Arc<T>
where
    T: EventRecorder,
{
    async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, note: String) {
        (**self).publish(node, severity, reason, note).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `EventRecorder` trait which creates `Event` objects through the Kubernetes API.
pub struct K8SEventRecorder {
    k8s_client: kube::Client,
    reporter: Reporter,
}

impl K8SEventRecorder {
    pub fn new(k8s_client: kube::Client) -> Self {
        K8SEventRecorder {
            k8s_client,
            reporter: Reporter {
                controller: COMPONENT.to_string(),
                instance: None,
            },
        }
    }
}

/// The action reported with an event, derived from its reason, e.g. `CordonFailed` is a `Cordon` action.
fn action_for(reason: &str) -> &str {
    ["Succeeded", "Failed"]
        .iter()
        .find_map(|suffix| reason.strip_suffix(suffix))
        .unwrap_or(reason)
}

#[async_trait]
impl EventRecorder for K8SEventRecorder {
    #[instrument(skip(self, node, note), fields(node = %node.name_any()))]
    async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, note: String) {
        let recorder = Recorder::new(
            self.k8s_client.clone(),
            self.reporter.clone(),
            node.object_ref(&()),
        );
        let published = recorder
            .publish(Event {
                type_: severity.into(),
                reason: reason.to_string(),
                note: Some(note),
                action: action_for(reason).to_string(),
                secondary: None,
            })
            .await;

        if let Err(err) = published {
            event!(
                Level::WARN,
                "Unable to publish '{}' event for node: '{}'",
                reason,
                err
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::constants::{
        EVENT_REASON_CORDON_FAILED, EVENT_REASON_CORDON_SUCCEEDED, EVENT_REASON_DRAIN_FAILED,
        EVENT_REASON_DRAIN_SUCCEEDED,
    };

    #[test]
    fn test_action_for() {
        let test_cases = vec![
            (EVENT_REASON_CORDON_SUCCEEDED, "Cordon"),
            (EVENT_REASON_CORDON_FAILED, "Cordon"),
            (EVENT_REASON_DRAIN_SUCCEEDED, "Drain"),
            (EVENT_REASON_DRAIN_FAILED, "Drain"),
            ("Other", "Other"),
        ];
        for (reason, expected) in test_cases {
            assert_eq!(action_for(reason), expected);
        }
    }

    #[test]
    fn test_severity_maps_to_event_type() {
        assert!(matches!(
            EventType::from(EventSeverity::Normal),
            EventType::Normal
        ));
        assert!(matches!(
            EventType::from(EventSeverity::Warning),
            EventType::Warning
        ));
    }
}
