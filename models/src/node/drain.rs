//! Provides an implementation for draining Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side. This implementation uses evictions, which respect
//! PodDisruptionBudgets (PDBs), and it never waits without bound: evictions are retried until a node-wide
//! deadline of `max grace period + eviction headroom`, and each evicted Pod is given at most its (capped)
//! grace period plus the headroom to disappear, never past that deadline.
//!
//! Cordoning lives in the `client` module, because it is a separate step taken as soon as a node is found
//! unhealthy.
use crate::cluster::{ClusterClient, ClusterError};
use crate::pod::{PodFilterSet, PodVerdict};

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::ResultExt;
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{event, instrument, Level};

// Maximum number of Pods to evict concurrently, Kubernetes' default limit on Pods per node. Waiting for Pods to
// be deleted is included in this limitation, and every Pod shares the same node deadline.
const CONCURRENT_EVICTIONS: usize = 110;

// When waiting for a PodDisruptionBudget to be satisfied we stall for a fixed rate between eviction attempts.
// `kubectl drain` similarly waits 5 seconds between eviction attempts.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// After evictions are created, we poll for the Pods to be deleted by Kubernetes.
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(2);

// Transient API errors are retried with exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);

// Kubernetes' default when a Pod does not specify `terminationGracePeriodSeconds`.
const DEFAULT_POD_GRACE_PERIOD: Duration = Duration::from_secs(30);

const DEFAULT_NAMESPACE: &str = "default";

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
}

/// Backoff delays for transient API errors, ending once the next attempt would land after `deadline`.
pub(super) fn retry_until(deadline: Instant) -> impl Iterator<Item = Duration> {
    retry_strategy().take_while(move |delay| Instant::now() + *delay <= deadline)
}

/// The result of trying to remove a single Pod from a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PodOutcome {
    /// The Pod is gone from the node.
    Evicted,
    /// The Pod was left in place by the pod filters.
    FilteredOut { reason: String },
    /// No eviction could be created before the deadline, or the API refused it outright.
    Failed { reason: String },
    /// The eviction was accepted but the Pod was still present when the wait ran out.
    TimedOut { waited: Duration },
}

impl PodOutcome {
    /// A short tag suitable for logs and metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            PodOutcome::Evicted => "evicted",
            PodOutcome::FilteredOut { .. } => "filtered-out",
            PodOutcome::Failed { .. } => "failed",
            PodOutcome::TimedOut { .. } => "timed-out",
        }
    }

    /// Whether this outcome counts against the success of the node's drain.
    pub fn is_failure(&self) -> bool {
        matches!(self, PodOutcome::Failed { .. } | PodOutcome::TimedOut { .. })
    }
}

/// Per-Pod results of draining a node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DrainReport {
    /// `(namespace/name, outcome)` for every Pod found on the node.
    pub pods: Vec<(String, PodOutcome)>,
    /// How many eviction requests had to be repeated.
    pub retries: u32,
}

impl DrainReport {
    pub fn outcome_of(&self, pod_key: &str) -> Option<&PodOutcome> {
        self.pods
            .iter()
            .find(|(key, _)| key == pod_key)
            .map(|(_, outcome)| outcome)
    }

    pub fn count(&self, tag: &str) -> usize {
        self.pods
            .iter()
            .filter(|(_, outcome)| outcome.tag() == tag)
            .count()
    }

    pub fn failed_pods(&self) -> Vec<&str> {
        self.pods
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Pods that were filtered out do not count against success.
    pub fn succeeded(&self) -> bool {
        self.pods.iter().all(|(_, outcome)| !outcome.is_failure())
    }

    fn failure_summary(&self) -> String {
        self.pods
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(key, outcome)| format!("{} ({})", key, outcome.tag()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Timing and eligibility settings for a drain.
#[derive(Debug)]
pub(crate) struct DrainSettings<'a> {
    pub max_grace_period: Duration,
    pub eviction_headroom: Duration,
    pub pod_filters: &'a PodFilterSet,
}

impl DrainSettings<'_> {
    /// The grace period requested for the Pod's eviction: its own, capped at the configured maximum.
    pub fn grace_period_for(&self, pod: &Pod) -> Duration {
        let requested = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.termination_grace_period_seconds)
            .map(|seconds| Duration::from_secs(seconds.max(0) as u64))
            .unwrap_or(DEFAULT_POD_GRACE_PERIOD);
        requested.min(self.max_grace_period)
    }

    /// The time allowed for the whole drain to create its evictions.
    pub fn drain_timeout(&self) -> Duration {
        self.max_grace_period + self.eviction_headroom
    }
}

enum EvictionRequest {
    Created,
    PodAlreadyGone,
}

/// Drains a node of all eligible Pods.
///
/// Every Pod on the node is run through the pod filters. Pods that pass are evicted concurrently with the grace
/// period `min(pod grace period, max grace period)`, and we then wait for each to actually disappear. The drain
/// succeeds if every Pod that passed the filters is gone before the node deadline.
#[instrument(skip(client, settings), err)]
pub(crate) async fn drain_node<C: ClusterClient>(
    client: &C,
    node_name: &str,
    settings: &DrainSettings<'_>,
) -> Result<DrainReport, error::DrainError> {
    let deadline = Instant::now() + settings.drain_timeout();

    let pods = RetryIf::spawn(
        retry_until(deadline),
        || client.list_pods_on_node(node_name),
        |err: &ClusterError| err.should_retry(),
    )
    .await
    .context(error::ListPodsSnafu { node_name })?;

    let mut report = DrainReport::default();
    let mut target_pods = Vec::new();
    for pod in pods {
        match settings.pod_filters.evaluate(&pod) {
            PodVerdict::Evict => target_pods.push(pod),
            PodVerdict::Skip(reason) => {
                event!(
                    Level::INFO,
                    pod = %pod_key(&pod),
                    %reason,
                    "Not draining Pod."
                );
                report
                    .pods
                    .push((pod_key(&pod), PodOutcome::FilteredOut { reason }));
            }
        }
    }

    let evictions: Vec<(String, PodOutcome, u32)> = stream::iter(target_pods)
        .map(|pod| evict_and_wait(client, pod, settings, deadline))
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .collect()
        .await;

    for (key, outcome, retries) in evictions {
        report.retries += retries;
        report.pods.push((key, outcome));
    }

    if report.succeeded() {
        event!(
            Level::INFO,
            evicted = report.count("evicted"),
            filtered_out = report.count("filtered-out"),
            retries = report.retries,
            "Drained node."
        );
        Ok(report)
    } else {
        error::IncompleteEvictionSnafu {
            node_name,
            report,
        }
        .fail()
    }
}

/// Evicts a single Pod and waits for it to be removed, reducing every failure to a `PodOutcome`.
async fn evict_and_wait<C: ClusterClient>(
    client: &C,
    pod: Pod,
    settings: &DrainSettings<'_>,
    deadline: Instant,
) -> (String, PodOutcome, u32) {
    let key = pod_key(&pod);
    let grace_period = settings.grace_period_for(&pod);
    let mut retries = 0;

    let outcome = match evict_pod(client, &pod, grace_period, deadline, &mut retries).await {
        Ok(EvictionRequest::PodAlreadyGone) => PodOutcome::Evicted,
        Ok(EvictionRequest::Created) => {
            let evicted_at = Instant::now();
            let wait_until = deadline.min(evicted_at + grace_period + settings.eviction_headroom);
            match wait_for_deletion(client, &pod, wait_until).await {
                Ok(()) => PodOutcome::Evicted,
                Err(_) => PodOutcome::TimedOut {
                    waited: wait_until.saturating_duration_since(evicted_at),
                },
            }
        }
        Err(err) => PodOutcome::Failed {
            reason: err.to_string(),
        },
    };

    (key, outcome, retries)
}

/// Create an eviction for the desired Pod, retrying until the deadline while the API asks us to.
///
/// When evicting, a 429 (TOO_MANY_REQUESTS) response indicates that we must wait for a PodDisruptionBudget to be
/// satisfied; those are retried at a fixed interval. Conflicts and server errors are retried with exponential
/// backoff. A 404 means the Pod is already gone, which is what we wanted.
#[instrument(skip(client, pod, retries), fields(pod = %pod_key(pod)), err)]
async fn evict_pod<C: ClusterClient>(
    client: &C,
    pod: &Pod,
    grace_period: Duration,
    deadline: Instant,
    retries: &mut u32,
) -> Result<EvictionRequest, error::EvictionError> {
    let namespace = pod_namespace(pod);
    let pod_name = pod.name_any();
    let mut backoff = retry_strategy();

    loop {
        event!(Level::INFO, "Attempting to evict pod {}", pod_name);
        let err = match client
            .evict_pod(&namespace, &pod_name, Some(grace_period))
            .await
        {
            Ok(()) => {
                event!(Level::INFO, "Successfully evicted Pod '{}'", pod_name);
                return Ok(EvictionRequest::Created);
            }
            Err(err) if err.is_not_found() => {
                event!(Level::INFO, "Pod '{}' is already gone.", pod_name);
                return Ok(EvictionRequest::PodAlreadyGone);
            }
            Err(err) if !err.should_retry() => {
                return Err(err).context(error::NonRetriableEvictionSnafu {
                    pod_name: pod_name.clone(),
                });
            }
            Err(err) => err,
        };

        let delay = if err.is_too_many_requests() {
            EVICTION_RETRY_INTERVAL
        } else {
            backoff.next().unwrap_or(RETRY_MAX_DELAY)
        };

        if Instant::now() + delay > deadline {
            return Err(err).context(error::EvictionDeadlineSnafu {
                pod_name: pod_name.clone(),
                attempts: *retries + 1,
            });
        }

        event!(
            Level::WARN,
            "Could not evict Pod '{}': '{}'. Retrying in {:.2}s.",
            pod_name,
            err,
            delay.as_secs_f64()
        );
        *retries += 1;
        sleep(delay).await;
    }
}

/// Wait for the given Pod to be deleted by Kubernetes, giving up at `until`.
///
/// A Pod counts as deleted once the API reports it missing, or once the name refers to a different Pod (a
/// StatefulSet may recreate a Pod under the same name).
#[instrument(skip(client, pod), fields(pod = %pod_key(pod)), err)]
async fn wait_for_deletion<C: ClusterClient>(
    client: &C,
    pod: &Pod,
    until: Instant,
) -> Result<(), error::DrainError> {
    let namespace = pod_namespace(pod);
    let pod_name = pod.name_any();
    let original_uid = pod.uid();

    let poll = async {
        loop {
            match client.get_pod(&namespace, &pod_name).await {
                Err(ClusterError::NotFound { .. }) => {
                    event!(Level::INFO, "Pod {} deleted.", pod_name);
                    return;
                }
                Ok(current) if current.uid() != original_uid => {
                    event!(Level::INFO, "Pod {} was replaced.", pod_name);
                    return;
                }
                Ok(_) => {
                    event!(
                        Level::DEBUG,
                        "Pod '{}' not yet deleted. Waiting {}s.",
                        pod_name,
                        DELETION_CHECK_INTERVAL.as_secs_f64()
                    );
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        "Could not determine if Pod '{}' has been deleted: '{}'. Waiting {}s.",
                        pod_name,
                        err,
                        DELETION_CHECK_INTERVAL.as_secs_f64()
                    );
                }
            }
            sleep(DELETION_CHECK_INTERVAL).await;
        }
    };

    let max_wait = until.saturating_duration_since(Instant::now());
    timeout_at(until, poll)
        .await
        .map_err(|_| error::DrainError::WaitForDeletion {
            pod_name: pod_key(pod),
            max_wait,
        })
}

fn pod_namespace(pod: &Pod) -> String {
    pod.namespace()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

/// `namespace/name`, which identifies a Pod across the cluster.
pub(crate) fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod_namespace(pod), pod.name_any())
}

pub mod error {
    use super::DrainReport;
    use crate::cluster::ClusterError;
    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to find drainable Pods for Node '{}': '{}'", node_name, source))]
        ListPods {
            source: ClusterError,
            node_name: String,
        },

        #[snafu(display("Pod '{}' was not deleted in the time allocated ({:.2}s).", pod_name, max_wait.as_secs_f64()))]
        WaitForDeletion {
            pod_name: String,
            max_wait: Duration,
        },

        #[snafu(display(
            "Node '{}' was not fully drained, remaining Pods: {}",
            node_name,
            report.failure_summary()
        ))]
        IncompleteEviction {
            node_name: String,
            report: DrainReport,
        },
    }

    impl DrainError {
        /// The per-Pod results, if the drain got as far as evicting.
        pub fn report(&self) -> Option<&DrainReport> {
            match self {
                Self::IncompleteEviction { report, .. } => Some(report),
                _ => None,
            }
        }
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        #[snafu(display(
            "Gave up evicting Pod '{}' after {} attempts: '{}'",
            pod_name,
            attempts,
            source
        ))]
        /// The drain deadline passed while the API kept asking us to retry.
        EvictionDeadline {
            source: ClusterError,
            pod_name: String,
            attempts: u32,
        },

        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
        NonRetriableEviction {
            source: ClusterError,
            pod_name: String,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::{test::api_error, MockClusterClient};
    use crate::pod::test::{fake_pod, with_empty_dir};
    use crate::pod::PodFilterConfig;
    use k8s_openapi::api::core::v1::PodSpec;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const MAX_GRACE: Duration = Duration::from_secs(60);
    const HEADROOM: Duration = Duration::from_secs(10);

    fn not_found(name: &str) -> ClusterError {
        ClusterError::NotFound {
            kind: "Pod".to_string(),
            name: name.to_string(),
        }
    }

    fn too_many_requests(name: &str) -> ClusterError {
        ClusterError::from_kube(api_error(429), "Pod", name)
    }

    fn with_grace(mut pod: Pod, seconds: i64) -> Pod {
        pod.spec = Some(PodSpec {
            termination_grace_period_seconds: Some(seconds),
            ..Default::default()
        });
        pod
    }

    fn default_filters() -> PodFilterSet {
        PodFilterSet::from_config(&PodFilterConfig::default())
    }

    fn settings(filters: &PodFilterSet) -> DrainSettings<'_> {
        DrainSettings {
            max_grace_period: MAX_GRACE,
            eviction_headroom: HEADROOM,
            pod_filters: filters,
        }
    }

    #[test]
    fn test_grace_period_is_capped() {
        let filters = default_filters();
        let settings = settings(&filters);
        let test_cases = vec![
            (with_grace(fake_pod("short"), 10), Duration::from_secs(10)),
            (with_grace(fake_pod("long"), 600), MAX_GRACE),
            (with_grace(fake_pod("zero"), 0), Duration::ZERO),
            (fake_pod("unset"), DEFAULT_POD_GRACE_PERIOD),
        ];
        for (pod, expected) in test_cases {
            assert_eq!(settings.grace_period_for(&pod), expected, "{}", pod.name_any());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_evicts_pods_and_skips_filtered() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .with(eq("n1"))
            .times(1)
            .returning(|_| {
                Ok(vec![
                    with_empty_dir(fake_pod("p1")),
                    fake_pod("p2"),
                    fake_pod("p3"),
                ])
            });
        client
            .expect_evict_pod()
            .withf(|_, name, grace| name != "p1" && *grace == Some(DEFAULT_POD_GRACE_PERIOD))
            .times(2)
            .returning(|_, _, _| Ok(()));
        client
            .expect_get_pod()
            .returning(|_, name| Err(not_found(name)));

        let report = drain_node(&client, "n1", &settings(&filters)).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.outcome_of("default/p1").unwrap().tag(), "filtered-out");
        assert_eq!(report.outcome_of("default/p2"), Some(&PodOutcome::Evicted));
        assert_eq!(report.outcome_of("default/p3"), Some(&PodOutcome::Evicted));
        assert_eq!(report.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disruption_budget_rejections_retry_until_deadline() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![fake_pod("p2")]));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        client.expect_evict_pod().returning(move |_, name, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(too_many_requests(name))
        });

        let start = Instant::now();
        let err = drain_node(&client, "n1", &settings(&filters))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        let report = err.report().expect("drain should report per-pod outcomes");
        assert_eq!(report.outcome_of("default/p2").unwrap().tag(), "failed");
        assert_eq!(report.failed_pods(), vec!["default/p2"]);
        // Attempts every 5s from t=0 through t=70s.
        assert_eq!(attempts.load(Ordering::SeqCst), 15);
        assert_eq!(report.retries, 14);
        assert!(elapsed <= MAX_GRACE + HEADROOM);
        assert!(elapsed >= MAX_GRACE + HEADROOM - EVICTION_RETRY_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![fake_pod("p1")]));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        client.expect_evict_pod().returning(move |_, name, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClusterError::from_kube(api_error(500), "Pod", name))
            } else {
                Ok(())
            }
        });
        client
            .expect_get_pod()
            .returning(|_, name| Err(not_found(name)));

        let report = drain_node(&client, "n1", &settings(&filters)).await.unwrap();
        assert_eq!(report.outcome_of("default/p1"), Some(&PodOutcome::Evicted));
        assert_eq!(report.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_eviction_fails_pod() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![fake_pod("p1")]));
        client
            .expect_evict_pod()
            .times(1)
            .returning(|_, name, _| Err(ClusterError::from_kube(api_error(403), "Pod", name)));

        let err = drain_node(&client, "n1", &settings(&filters))
            .await
            .unwrap_err();
        assert_eq!(err.report().unwrap().failed_pods(), vec!["default/p1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_missing_at_eviction_counts_as_evicted() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![fake_pod("p1")]));
        client
            .expect_evict_pod()
            .returning(|_, name, _| Err(not_found(name)));
        client.expect_get_pod().never();

        let report = drain_node(&client, "n1", &settings(&filters)).await.unwrap();
        assert_eq!(report.outcome_of("default/p1"), Some(&PodOutcome::Evicted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_is_bounded_by_grace_and_headroom() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![with_grace(fake_pod("stuck"), 20)]));
        client.expect_evict_pod().returning(|_, _, _| Ok(()));
        client
            .expect_get_pod()
            .returning(|_, name| Ok(fake_pod(name)));

        let start = Instant::now();
        let err = drain_node(&client, "n1", &settings(&filters))
            .await
            .unwrap_err();

        let max_wait = Duration::from_secs(20) + HEADROOM;
        assert_eq!(
            err.report().unwrap().outcome_of("default/stuck"),
            Some(&PodOutcome::TimedOut { waited: max_wait })
        );
        assert!(start.elapsed() <= max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_pod_counts_as_deleted() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![fake_pod("db-0")]));
        client.expect_evict_pod().returning(|_, _, _| Ok(()));
        client.expect_get_pod().returning(|_, name| {
            let mut replacement = fake_pod(name);
            replacement.metadata.uid = Some("recreated".to_string());
            Ok(replacement)
        });

        let report = drain_node(&client, "n1", &settings(&filters)).await.unwrap();
        assert_eq!(report.outcome_of("default/db-0"), Some(&PodOutcome::Evicted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_pods_beyond_concurrency_limit_are_evicted() {
        const DELETION_DELAY: Duration = Duration::from_secs(25);
        let pod_count = CONCURRENT_EVICTIONS + 5;
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client.expect_list_pods_on_node().returning(move |_| {
            Ok((0..pod_count)
                .map(|i| fake_pod(&format!("p{}", i)))
                .collect())
        });
        let evicted_at: Arc<Mutex<HashMap<String, Instant>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let evictions = evicted_at.clone();
        client.expect_evict_pod().returning(move |_, name, _| {
            evictions
                .lock()
                .unwrap()
                .insert(name.to_string(), Instant::now());
            Ok(())
        });
        let evictions = evicted_at.clone();
        client.expect_get_pod().returning(move |_, name| {
            let gone = evictions
                .lock()
                .unwrap()
                .get(name)
                .map_or(false, |at| at.elapsed() >= DELETION_DELAY);
            if gone {
                Err(not_found(name))
            } else {
                Ok(fake_pod(name))
            }
        });

        let start = Instant::now();
        let report = drain_node(&client, "n1", &settings(&filters)).await.unwrap();

        assert_eq!(report.count("evicted"), pod_count);
        assert!(start.elapsed() <= MAX_GRACE + HEADROOM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_ends_at_node_deadline() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        // Capped to MAX_GRACE, so its own wait would outlast the node deadline.
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![with_grace(fake_pod("slow"), 600)]));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        client.expect_evict_pod().returning(move |_, name, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                Err(too_many_requests(name))
            } else {
                Ok(())
            }
        });
        client
            .expect_get_pod()
            .returning(|_, name| Ok(fake_pod(name)));

        let start = Instant::now();
        let err = drain_node(&client, "n1", &settings(&filters))
            .await
            .unwrap_err();

        // Accepted on the fifth attempt, 20s in.
        let report = err.report().unwrap();
        assert_eq!(report.retries, 4);
        assert_eq!(
            report.outcome_of("default/slow"),
            Some(&PodOutcome::TimedOut {
                waited: MAX_GRACE + HEADROOM - 4 * EVICTION_RETRY_INTERVAL
            })
        );
        assert!(start.elapsed() <= MAX_GRACE + HEADROOM);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_list_failure_is_retried() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        let mut seq = Sequence::new();
        client
            .expect_list_pods_on_node()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Err(ClusterError::from_kube(api_error(503), "Node", name)));
        client
            .expect_list_pods_on_node()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![fake_pod("p1")]));
        client.expect_evict_pod().returning(|_, _, _| Ok(()));
        client
            .expect_get_pod()
            .returning(|_, name| Err(not_found(name)));

        let report = drain_node(&client, "n1", &settings(&filters)).await.unwrap();
        assert_eq!(report.outcome_of("default/p1"), Some(&PodOutcome::Evicted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_retries_stop_at_deadline() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        client.expect_list_pods_on_node().returning(move |name| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::from_kube(api_error(500), "Node", name))
        });

        let start = Instant::now();
        let err = drain_node(&client, "n1", &settings(&filters))
            .await
            .unwrap_err();

        assert!(matches!(err, error::DrainError::ListPods { .. }));
        assert!(attempts.load(Ordering::SeqCst) > 1);
        assert!(start.elapsed() <= MAX_GRACE + HEADROOM);
    }

    #[tokio::test]
    async fn test_rejected_list_fails_drain() {
        let filters = default_filters();
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods_on_node()
            .times(1)
            .returning(|name| Err(ClusterError::from_kube(api_error(403), "Node", name)));

        let err = drain_node(&client, "n1", &settings(&filters))
            .await
            .unwrap_err();
        assert!(matches!(err, error::DrainError::ListPods { .. }));
        assert!(err.report().is_none());
    }
}
