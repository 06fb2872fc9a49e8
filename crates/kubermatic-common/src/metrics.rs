//! Metrics for the Kubermatic controllers
//!
//! Provides OpenTelemetry metrics for:
//! - Cluster lifecycle (phase counts, reconcile duration, errors)
//! - Resource ensure operations (created, updated, unchanged)
//! - Retry budget exhaustion
//!
//! Instruments are held by an explicit [`ControllerMetrics`] handle that is
//! constructed once at startup and passed to each controller through its
//! context. Nothing here reads or writes global state beyond the meter
//! provider installed by telemetry init.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Handle to all controller instruments.
///
/// Cheap to clone; instruments are internally reference counted.
#[derive(Clone)]
pub struct ControllerMetrics {
    clusters_total: Gauge<i64>,
    reconcile_duration: Histogram<f64>,
    reconcile_errors: Counter<u64>,
    ensure_operations: Counter<u64>,
    retries_exhausted: Counter<u64>,
}

impl ControllerMetrics {
    /// Build all instruments against the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            clusters_total: meter
                .i64_gauge("kubermatic_clusters_total")
                .with_description("Total number of clusters by phase")
                .with_unit("{clusters}")
                .build(),
            reconcile_duration: meter
                .f64_histogram("kubermatic_reconcile_duration_seconds")
                .with_description("Duration of reconciliations in seconds")
                .with_unit("s")
                .build(),
            reconcile_errors: meter
                .u64_counter("kubermatic_reconcile_errors_total")
                .with_description("Total number of reconciliation errors")
                .with_unit("{errors}")
                .build(),
            ensure_operations: meter
                .u64_counter("kubermatic_ensure_operations_total")
                .with_description("Resource ensure operations by kind and outcome")
                .with_unit("{operations}")
                .build(),
            retries_exhausted: meter
                .u64_counter("kubermatic_retries_exhausted_total")
                .with_description("Objects dropped after exhausting their retry budget")
                .with_unit("{objects}")
                .build(),
        }
    }

    /// Build instruments against the globally installed meter provider
    pub fn from_global() -> Self {
        Self::new(&global::meter("kubermatic"))
    }

    /// Update the per-phase cluster count gauge
    ///
    /// Labels:
    /// - `phase`: validating, pending, launching, running, updating, paused,
    ///   deleting, failed
    pub fn set_cluster_phase_count(&self, phase: &str, count: i64) {
        self.clusters_total
            .record(count, &[KeyValue::new("phase", phase.to_string())]);
    }

    /// Record an ensure operation outcome
    ///
    /// Labels:
    /// - `kind`: Service, Secret, ConfigMap, Deployment, ...
    /// - `outcome`: created, updated, unchanged
    pub fn record_ensure(&self, kind: &str, outcome: &str) {
        self.ensure_operations.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }

    /// Record an object dropped by the bounded retry policy
    ///
    /// Labels:
    /// - `controller`: cluster, monitoring, rbac-project, rbac-resource
    pub fn record_retry_exhausted(&self, controller: &str) {
        self.retries_exhausted.add(
            1,
            &[KeyValue::new("controller", controller.to_string())],
        );
    }

    /// Start timing a reconciliation
    pub fn reconcile_timer(
        &self,
        controller: &'static str,
        object: impl Into<String>,
    ) -> ReconcileTimer {
        ReconcileTimer {
            metrics: self.clone(),
            controller,
            object: object.into(),
            start: std::time::Instant::now(),
        }
    }
}

/// Record a reconciliation with timing
///
/// Labels:
/// - `controller`: which controller ran
/// - `result`: success, error
pub struct ReconcileTimer {
    metrics: ControllerMetrics,
    controller: &'static str,
    object: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics.reconcile_duration.record(
            duration,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    ///
    /// `error_type` is `transient` or `permanent`, taken from the error's
    /// retryability.
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics.reconcile_duration.record(
            duration,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "error"),
            ],
        );
        self.metrics.reconcile_errors.add(
            1,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("object", self.object),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}
