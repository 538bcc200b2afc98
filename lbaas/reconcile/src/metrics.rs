use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Reconciler metrics. Clones share the same underlying series.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    reconciles: Family<ResultLabels, Counter>,
    device_errors: Family<StepLabels, Counter>,
    sync_attempts: Counter,
    sync_failures: Counter,
    serializer_waiters: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StepLabels {
    step: String,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "reconciles",
            "Count of service reconciliations by result",
            metrics.reconciles.clone(),
        );
        prom.register(
            "device_errors",
            "Count of device errors by the step that raised them",
            metrics.device_errors.clone(),
        );
        prom.register(
            "sync_attempts",
            "Count of device group sync attempts",
            metrics.sync_attempts.clone(),
        );
        prom.register(
            "sync_failures",
            "Count of device group syncs that failed after every attempt",
            metrics.sync_failures.clone(),
        );
        prom.register(
            "serializer_waiters",
            "Gauge of requests holding or waiting for a pool's ticket",
            metrics.serializer_waiters.clone(),
        );

        metrics
    }

    pub(crate) fn reconciled(&self, result: &str) {
        self.reconciles
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub(crate) fn device_error(&self, step: impl std::fmt::Display) {
        self.device_errors
            .get_or_create(&StepLabels {
                step: step.to_string(),
            })
            .inc();
    }

    pub(crate) fn sync_attempt(&self) {
        self.sync_attempts.inc();
    }

    pub(crate) fn sync_failed(&self) {
        self.sync_failures.inc();
    }

    /// The gauge a [`crate::RequestSerializer`] reports its waiters to.
    pub fn serializer_waiters(&self) -> Gauge {
        self.serializer_waiters.clone()
    }
}
