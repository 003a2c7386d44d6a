//! Predicates deciding which pods on a draining node are evicted.
//!
//! Each `PodFilter` looks at a single pod and either lets it through or explains why it must stay. A
//! `PodFilterSet` combines filters with AND semantics: a pod is evicted only if every filter lets it through.
use crate::constants::{
    DAEMONSET_KIND, MIRROR_POD_ANNOTATION, POD_PHASE_FAILED, POD_PHASE_SUCCEEDED,
};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::fmt::Debug;

/// The decision a filter reaches about a single pod.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PodVerdict {
    /// The pod may be evicted as far as this filter is concerned.
    Evict,
    /// The pod must not be evicted, for the given reason.
    Skip(String),
}

impl PodVerdict {
    pub fn is_evict(&self) -> bool {
        matches!(self, PodVerdict::Evict)
    }
}

pub trait PodFilter: Debug + Send + Sync {
    /// A short identifier used in logs.
    fn name(&self) -> &'static str;
    fn evaluate(&self, pod: &Pod) -> PodVerdict;
}

/// Returns the owner reference marked as the pod's managing controller, if any.
fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    pod.owner_references()
        .iter()
        .find(|reference| reference.controller == Some(true))
}

fn is_finished(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map_or(false, |phase| {
            phase == POD_PHASE_SUCCEEDED || phase == POD_PHASE_FAILED
        })
}

/// Skips static pods. Their API objects are mirrors of pods run directly by the kubelet and cannot be evicted.
#[derive(Debug, Default)]
pub struct MirrorPodFilter;

impl PodFilter for MirrorPodFilter {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn evaluate(&self, pod: &Pod) -> PodVerdict {
        if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
            PodVerdict::Skip("pod is a static mirror pod".to_string())
        } else {
            PodVerdict::Evict
        }
    }
}

/// Skips pods with `emptyDir` volumes, whose data is lost when they are evicted.
#[derive(Debug, Default)]
pub struct LocalStoragePodFilter;

impl PodFilter for LocalStoragePodFilter {
    fn name(&self) -> &'static str {
        "local-storage"
    }

    fn evaluate(&self, pod: &Pod) -> PodVerdict {
        let local_volume = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .and_then(|volumes| volumes.iter().find(|volume| volume.empty_dir.is_some()));

        match local_volume {
            Some(volume) => PodVerdict::Skip(format!(
                "pod uses local storage (emptyDir volume '{}')",
                volume.name
            )),
            None => PodVerdict::Evict,
        }
    }
}

/// Skips running pods without a managing controller; nothing would replace them.
#[derive(Debug, Default)]
pub struct UnreplicatedPodFilter;

impl PodFilter for UnreplicatedPodFilter {
    fn name(&self) -> &'static str {
        "unreplicated"
    }

    fn evaluate(&self, pod: &Pod) -> PodVerdict {
        // A pod that already ran to completion loses nothing by being evicted.
        if is_finished(pod) || controller_of(pod).is_some() {
            PodVerdict::Evict
        } else {
            PodVerdict::Skip("pod is not managed by a controller".to_string())
        }
    }
}

/// Skips pods managed by a DaemonSet. The DaemonSet controller ignores cordons and would recreate them in place.
#[derive(Debug, Default)]
pub struct DaemonSetPodFilter;

impl PodFilter for DaemonSetPodFilter {
    fn name(&self) -> &'static str {
        "daemonset"
    }

    fn evaluate(&self, pod: &Pod) -> PodVerdict {
        match controller_of(pod) {
            Some(owner) if owner.kind == DAEMONSET_KIND => {
                PodVerdict::Skip(format!("pod is a member of DaemonSet '{}'", owner.name))
            }
            _ => PodVerdict::Evict,
        }
    }
}

/// An annotation that protects a pod from eviction: either just a key, or a key with an exact value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnnotationMarker {
    pub key: String,
    pub value: Option<String>,
}

impl AnnotationMarker {
    /// Parses `KEY` or `KEY=VALUE`.
    pub fn parse(marker: &str) -> Self {
        match marker.split_once('=') {
            Some((key, value)) => AnnotationMarker {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
            None => AnnotationMarker {
                key: marker.to_string(),
                value: None,
            },
        }
    }

    fn matches(&self, pod: &Pod) -> bool {
        match (pod.annotations().get(&self.key), &self.value) {
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
            (None, _) => false,
        }
    }
}

impl std::fmt::Display for AnnotationMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Skips pods carrying any of the configured protection annotations.
#[derive(Debug, Default)]
pub struct ProtectedPodFilter {
    markers: Vec<AnnotationMarker>,
}

impl ProtectedPodFilter {
    pub fn new<S: AsRef<str>>(markers: &[S]) -> Self {
        ProtectedPodFilter {
            markers: markers
                .iter()
                .map(|marker| AnnotationMarker::parse(marker.as_ref()))
                .collect(),
        }
    }
}

impl PodFilter for ProtectedPodFilter {
    fn name(&self) -> &'static str {
        "protected-annotation"
    }

    fn evaluate(&self, pod: &Pod) -> PodVerdict {
        match self.markers.iter().find(|marker| marker.matches(pod)) {
            Some(marker) => {
                PodVerdict::Skip(format!("pod is protected by annotation '{}'", marker))
            }
            None => PodVerdict::Evict,
        }
    }
}

/// Toggles controlling which kinds of pods are eligible for eviction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PodFilterConfig {
    pub evict_daemonset_pods: bool,
    pub evict_local_storage_pods: bool,
    pub evict_unreplicated_pods: bool,
    /// `KEY` or `KEY=VALUE` annotations that protect a pod from eviction.
    pub protected_annotations: Vec<String>,
}

/// An ordered set of pod filters combined with AND semantics.
#[derive(Debug, Default)]
pub struct PodFilterSet {
    filters: Vec<Box<dyn PodFilter>>,
}

impl PodFilterSet {
    pub fn from_config(config: &PodFilterConfig) -> Self {
        let mut filters: Vec<Box<dyn PodFilter>> = vec![Box::new(MirrorPodFilter)];
        if !config.evict_local_storage_pods {
            filters.push(Box::new(LocalStoragePodFilter));
        }
        if !config.evict_unreplicated_pods {
            filters.push(Box::new(UnreplicatedPodFilter));
        }
        if !config.evict_daemonset_pods {
            filters.push(Box::new(DaemonSetPodFilter));
        }
        if !config.protected_annotations.is_empty() {
            filters.push(Box::new(ProtectedPodFilter::new(
                &config.protected_annotations,
            )));
        }
        PodFilterSet { filters }
    }

    /// Names of the active filters, in evaluation order.
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Returns `Evict` only if every filter lets the pod through. Otherwise returns the first refusal.
    pub fn evaluate(&self, pod: &Pod) -> PodVerdict {
        for filter in &self.filters {
            if let PodVerdict::Skip(reason) = filter.evaluate(pod) {
                return PodVerdict::Skip(format!("{}: {}", filter.name(), reason));
            }
        }
        PodVerdict::Evict
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, PodSpec, PodStatus, Volume};
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    pub(crate) fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{}-uid", name),
            controller: Some(true),
            ..Default::default()
        }
    }

    /// A pod owned by a ReplicaSet with no volumes, which every default filter lets through.
    pub(crate) fn fake_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{}-uid", name)),
                owner_references: Some(vec![owner("ReplicaSet", "web-5d8f")]),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    pub(crate) fn with_empty_dir(mut pod: Pod) -> Pod {
        pod.spec = Some(PodSpec {
            volumes: Some(vec![Volume {
                name: "scratch".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn unowned(mut pod: Pod) -> Pod {
        pod.metadata.owner_references = None;
        pod
    }

    fn with_phase(mut pod: Pod, phase: &str) -> Pod {
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn with_annotations(mut pod: Pod, annotations: &[(&str, &str)]) -> Pod {
        pod.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod
    }

    fn daemonset_pod() -> Pod {
        let mut pod = fake_pod("fluentd-x8k2");
        pod.metadata.owner_references = Some(vec![owner(DAEMONSET_KIND, "fluentd")]);
        pod
    }

    #[test]
    fn test_mirror_pod_filter() {
        let mirror = with_annotations(fake_pod("kube-proxy"), &[(MIRROR_POD_ANNOTATION, "abc")]);
        assert!(!MirrorPodFilter.evaluate(&mirror).is_evict());
        assert!(MirrorPodFilter.evaluate(&fake_pod("web")).is_evict());
    }

    #[test]
    fn test_local_storage_filter() {
        let verdict = LocalStoragePodFilter.evaluate(&with_empty_dir(fake_pod("cache")));
        assert_eq!(
            verdict,
            PodVerdict::Skip("pod uses local storage (emptyDir volume 'scratch')".to_string())
        );
        assert!(LocalStoragePodFilter.evaluate(&fake_pod("web")).is_evict());
    }

    #[test]
    fn test_unreplicated_filter() {
        let test_cases = vec![
            (fake_pod("web"), true),
            (unowned(fake_pod("bare")), false),
            (with_phase(unowned(fake_pod("job-done")), POD_PHASE_SUCCEEDED), true),
            (with_phase(unowned(fake_pod("job-failed")), POD_PHASE_FAILED), true),
            (with_phase(unowned(fake_pod("running")), "Running"), false),
        ];
        for (pod, evict) in test_cases {
            assert_eq!(
                UnreplicatedPodFilter.evaluate(&pod).is_evict(),
                evict,
                "{}",
                pod.name_any()
            );
        }
    }

    #[test]
    fn test_unreplicated_filter_ignores_non_controller_owners() {
        let mut pod = fake_pod("adopted");
        let mut reference = owner("ConfigMap", "settings");
        reference.controller = None;
        pod.metadata.owner_references = Some(vec![reference]);
        assert!(!UnreplicatedPodFilter.evaluate(&pod).is_evict());
    }

    #[test]
    fn test_daemonset_filter() {
        assert_eq!(
            DaemonSetPodFilter.evaluate(&daemonset_pod()),
            PodVerdict::Skip("pod is a member of DaemonSet 'fluentd'".to_string())
        );
        assert!(DaemonSetPodFilter.evaluate(&fake_pod("web")).is_evict());
    }

    #[test]
    fn test_protected_annotation_filter() {
        let filter = ProtectedPodFilter::new(&["example.com/protect", "team=payments"]);
        let test_cases = vec![
            (fake_pod("plain"), true),
            (with_annotations(fake_pod("keyed"), &[("example.com/protect", "")]), false),
            (with_annotations(fake_pod("keyed-any"), &[("example.com/protect", "yes")]), false),
            (with_annotations(fake_pod("valued"), &[("team", "payments")]), false),
            (with_annotations(fake_pod("other-value"), &[("team", "search")]), true),
        ];
        for (pod, evict) in test_cases {
            assert_eq!(filter.evaluate(&pod).is_evict(), evict, "{}", pod.name_any());
        }
    }

    #[test]
    fn test_annotation_marker_parse() {
        assert_eq!(
            AnnotationMarker::parse("a=b=c"),
            AnnotationMarker {
                key: "a".to_string(),
                value: Some("b=c".to_string())
            }
        );
        assert_eq!(AnnotationMarker::parse("key").value, None);
        assert_eq!(AnnotationMarker::parse("key=").value, Some(String::new()));
    }

    #[test]
    fn test_filter_set_from_config() {
        let test_cases = vec![
            (
                PodFilterConfig::default(),
                vec!["mirror", "local-storage", "unreplicated", "daemonset"],
            ),
            (
                PodFilterConfig {
                    evict_daemonset_pods: true,
                    evict_local_storage_pods: true,
                    evict_unreplicated_pods: true,
                    protected_annotations: vec![],
                },
                vec!["mirror"],
            ),
            (
                PodFilterConfig {
                    evict_local_storage_pods: true,
                    protected_annotations: vec!["keep".to_string()],
                    ..Default::default()
                },
                vec!["mirror", "unreplicated", "daemonset", "protected-annotation"],
            ),
        ];
        for (config, names) in test_cases {
            assert_eq!(PodFilterSet::from_config(&config).filter_names(), names);
        }
    }

    #[test]
    fn test_filter_set_requires_every_filter() {
        let filters = PodFilterSet::from_config(&PodFilterConfig {
            evict_daemonset_pods: true,
            protected_annotations: vec!["keep".to_string()],
            ..Default::default()
        });

        assert!(filters.evaluate(&fake_pod("web")).is_evict());
        assert!(filters.evaluate(&daemonset_pod()).is_evict());

        // Each of these is refused by exactly one filter while passing all the others.
        let refused = vec![
            with_empty_dir(fake_pod("cache")),
            unowned(fake_pod("bare")),
            with_annotations(fake_pod("kept"), &[("keep", "1")]),
            with_annotations(fake_pod("static"), &[(MIRROR_POD_ANNOTATION, "x")]),
        ];
        for pod in refused {
            assert!(!filters.evaluate(&pod).is_evict(), "{}", pod.name_any());
        }
    }

    #[test]
    fn test_skip_reason_names_filter() {
        let filters = PodFilterSet::from_config(&PodFilterConfig::default());
        let mut pod = with_empty_dir(fake_pod("cache"));
        pod.metadata.labels = Some(btreemap! {"app".to_string() => "cache".to_string()});
        match filters.evaluate(&pod) {
            PodVerdict::Skip(reason) => assert!(reason.starts_with("local-storage: ")),
            PodVerdict::Evict => panic!("pod with local storage was not skipped"),
        }
    }
}
