//! Controller metrics
//!
//! Prometheus collectors for reconciliation passes. Create them once
//! against a [`Registry`] and hand the same instance to the controller.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// How a reconciliation pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Nothing changed, nothing written
    Unchanged,
    /// The pass produced a new state
    Updated,
    /// The engine returned an error
    Error,
    /// The pass panicked
    Panic,
}

impl OperationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

/// Metrics for the dispatch loop
pub struct ControllerMetrics {
    /// Reconciliation passes by outcome
    pub operations_total: IntCounterVec,

    /// Engine time per pass
    pub operation_duration_seconds: HistogramVec,

    /// Workflow writes by result
    pub persists_total: IntCounterVec,

    /// Items waiting in each work queue
    pub queue_depth: IntGaugeVec,
}

impl ControllerMetrics {
    /// Create and register controller metrics
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let operations_total = IntCounterVec::new(
            Opts::new("workflow_operations_total", "Total reconciliation passes"),
            &["outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "workflow_operation_duration_seconds",
                "Time spent in one reconciliation pass",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["result"],
        )?;
        registry.register(Box::new(operation_duration_seconds.clone()))?;

        let persists_total = IntCounterVec::new(
            Opts::new("workflow_persists_total", "Total workflow writes"),
            &["result"],
        )?;
        registry.register(Box::new(persists_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("workflow_queue_depth", "Items waiting in a work queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration_seconds,
            persists_total,
            queue_depth,
        })
    }

    /// Record how a pass ended
    pub fn record_operation(&self, outcome: OperationOutcome) {
        self.operations_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Record engine time for a pass
    pub fn observe_duration(&self, ok: bool, duration_secs: f64) {
        let result = if ok { "ok" } else { "error" };
        self.operation_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_persist(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.persists_total.with_label_values(&[result]).inc();
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[queue])
            .set(depth as i64);
    }

    /// Passes that ended with `outcome`
    pub fn operations(&self, outcome: OperationOutcome) -> u64 {
        self.operations_total
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    /// Passes timed so far
    pub fn timed_operations(&self) -> u64 {
        ["ok", "error"]
            .into_iter()
            .map(|r| {
                self.operation_duration_seconds
                    .with_label_values(&[r])
                    .get_sample_count()
            })
            .sum()
    }

    pub fn persists(&self, ok: bool) -> u64 {
        let result = if ok { "ok" } else { "error" };
        self.persists_total.with_label_values(&[result]).get()
    }
}

/// Render a registry in the Prometheus text format
pub fn export_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_counters() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        metrics.record_operation(OperationOutcome::Updated);
        metrics.record_operation(OperationOutcome::Updated);
        metrics.record_operation(OperationOutcome::Panic);
        metrics.observe_duration(true, 0.002);
        metrics.observe_duration(false, 0.5);

        assert_eq!(metrics.operations(OperationOutcome::Updated), 2);
        assert_eq!(metrics.operations(OperationOutcome::Panic), 1);
        assert_eq!(metrics.operations(OperationOutcome::Error), 0);
        assert_eq!(metrics.timed_operations(), 2);
    }

    #[test]
    fn test_registering_twice_fails() {
        let registry = Registry::new();
        ControllerMetrics::new(&registry).unwrap();
        assert!(ControllerMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_export_metrics() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        metrics.record_persist(true);
        metrics.set_queue_depth("workflows", 3);

        let output = export_metrics(&registry).unwrap();
        assert!(output.contains("workflow_persists_total{result=\"ok\"} 1"));
        assert!(output.contains("workflow_queue_depth{queue=\"workflows\"} 3"));
    }
}
