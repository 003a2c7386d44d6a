use models::constants::{RESULT_FAILED, RESULT_SUCCEEDED};

use opentelemetry::{
    metrics::{Counter, Meter},
    Key, KeyValue,
};
use tracing::instrument;

const RESULT_KEY: Key = Key::from_static_str("result");

/// Counters of cordon and drain attempts, tagged by outcome.
#[derive(Clone, Debug)]
pub struct DrainerMetrics {
    cordoned_nodes: Counter<u64>,
    drained_nodes: Counter<u64>,
}

impl DrainerMetrics {
    #[instrument(skip(meter))]
    pub fn new(meter: Meter) -> Self {
        let cordoned_nodes = meter
            .u64_counter("cordoned_nodes")
            .with_description("Number of nodes cordoned.")
            .init();

        let drained_nodes = meter
            .u64_counter("drained_nodes")
            .with_description("Number of nodes drained.")
            .init();

        DrainerMetrics {
            cordoned_nodes,
            drained_nodes,
        }
    }

    pub fn record_cordon(&self, succeeded: bool) {
        self.cordoned_nodes.add(1, &[result(succeeded)]);
    }

    pub fn record_drain(&self, succeeded: bool) {
        self.drained_nodes.add(1, &[result(succeeded)]);
    }
}

fn result(succeeded: bool) -> KeyValue {
    RESULT_KEY.string(if succeeded {
        RESULT_SUCCEEDED
    } else {
        RESULT_FAILED
    })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::telemetry::prometheus_meter_provider;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::Registry;

    /// Metrics exported into a fresh registry. The provider must outlive any reads from the registry.
    pub(crate) fn test_metrics() -> (DrainerMetrics, Registry, SdkMeterProvider) {
        let registry = Registry::new();
        let provider = prometheus_meter_provider(&registry).unwrap();
        let metrics = DrainerMetrics::new(provider.meter("test"));
        (metrics, registry, provider)
    }

    /// The value of a counter for the given `result` tag, or 0 if it was never incremented.
    pub(crate) fn counter_value(registry: &Registry, name: &str, result: &str) -> u64 {
        registry
            .gather()
            .iter()
            .filter(|family| family.get_name().ends_with(&format!("{}_total", name)))
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "result" && label.get_value() == result)
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    #[test]
    fn test_counters_are_tagged_by_result() {
        let (metrics, registry, _provider) = test_metrics();
        metrics.record_cordon(true);
        metrics.record_cordon(true);
        metrics.record_cordon(false);
        metrics.record_drain(false);

        assert_eq!(counter_value(&registry, "cordoned_nodes", RESULT_SUCCEEDED), 2);
        assert_eq!(counter_value(&registry, "cordoned_nodes", RESULT_FAILED), 1);
        assert_eq!(counter_value(&registry, "drained_nodes", RESULT_SUCCEEDED), 0);
        assert_eq!(counter_value(&registry, "drained_nodes", RESULT_FAILED), 1);
    }

    #[test]
    fn test_metric_names_are_namespaced() {
        let (metrics, registry, _provider) = test_metrics();
        metrics.record_cordon(true);
        metrics.record_drain(true);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"draino_cordoned_nodes_total".to_string()), "{:?}", names);
        assert!(names.contains(&"draino_drained_nodes_total".to_string()), "{:?}", names);
    }
}
