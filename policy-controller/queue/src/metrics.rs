use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    pub(crate) adds: Counter,
    pub(crate) retries: Counter,
    pub(crate) depth: Gauge,
}

// === impl QueueMetrics ===

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let adds = Counter::default();
        prom.register(
            "adds",
            "Count of items added to the work queue",
            adds.clone(),
        );

        let retries = Counter::default();
        prom.register(
            "retries",
            "Count of items re-added to the work queue after a failure",
            retries.clone(),
        );

        let depth = Gauge::default();
        prom.register(
            "depth",
            "Gauge of the number of items waiting in the work queue",
            depth.clone(),
        );

        Self {
            adds,
            retries,
            depth,
        }
    }
}
