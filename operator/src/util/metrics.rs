use prometheus::{HistogramVec, IntCounterVec, Opts, Registry};

/// Reconciler-facing counters and histograms for the `Domain` controller.
/// One instance per process; `registry` is handed to [`domain_common::metrics::serve`]
/// so `/metrics` exposes whatever got registered here.
pub struct ControllerMetrics {
    pub registry: Registry,
    pub reconcile_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
    pub action_counter: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new(namespace: &str) -> Self {
        let registry = Registry::new();

        let reconcile_counter = IntCounterVec::new(
            Opts::new("reconcile_total", "Total Domain reconciliation cycles").namespace(namespace),
            &["domain", "namespace"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(reconcile_counter.clone()))
            .expect("metric not yet registered");

        let read_histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "read_phase_seconds",
                "Time spent computing the next action for a Domain",
            )
            .namespace(namespace),
            &["domain", "namespace", "action"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(read_histogram.clone()))
            .expect("metric not yet registered");

        let write_histogram = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "write_phase_seconds",
                "Time spent applying an action for a Domain",
            )
            .namespace(namespace),
            &["domain", "namespace", "action"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(write_histogram.clone()))
            .expect("metric not yet registered");

        let action_counter = IntCounterVec::new(
            Opts::new("action_total", "Actions taken per Domain").namespace(namespace),
            &["domain", "namespace", "action"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(action_counter.clone()))
            .expect("metric not yet registered");

        ControllerMetrics {
            registry,
            reconcile_counter,
            read_histogram,
            write_histogram,
            action_counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking_and_gathers_families() {
        let metrics = ControllerMetrics::new("domain_operator");
        metrics
            .reconcile_counter
            .with_label_values(&["sample", "default"])
            .inc();
        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }
}
