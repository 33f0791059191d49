use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    pub(crate) size: Gauge,
    pub(crate) applies: Counter,
    pub(crate) deletes: Counter,
    pub(crate) invalid: Counter,
    pub(crate) resyncs: Counter,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let size = Gauge::default();
        prom.register(
            "size",
            "Gauge of the number of policies in the index",
            size.clone(),
        );

        let applies = Counter::default();
        prom.register(
            "applies",
            "Count of policy applies to the index",
            applies.clone(),
        );

        let deletes = Counter::default();
        prom.register(
            "deletes",
            "Count of policy deletes from the index",
            deletes.clone(),
        );

        let invalid = Counter::default();
        prom.register(
            "invalid",
            "Count of policies ignored because they could not be converted",
            invalid.clone(),
        );

        let resyncs = Counter::default();
        prom.register(
            "resyncs",
            "Count of resyncs triggered by a new leadership term",
            resyncs.clone(),
        );

        Self {
            size,
            applies,
            deletes,
            invalid,
            resyncs,
        }
    }
}
