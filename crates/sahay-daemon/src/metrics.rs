//! Prometheus metrics.
//!
//! Exposed at `GET /metrics` in text format. Counters track the write
//! surfaces; gauges mirror the two queues an operator watches during an
//! incident (aggregation buffer, anchor backlog).

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Daemon metrics registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Sync items by outcome (`accepted`, `duplicate`, `rejected:*`).
    pub sync_items_total: IntCounterVec,
    /// Accepted analytics emissions.
    pub analytics_events_total: IntCounter,
    /// SLA escalations performed.
    pub escalations_total: IntCounter,
    /// Anchor submissions by result (`submitted`, `requeued`, `failed`).
    pub anchor_jobs_total: IntCounterVec,
    /// Distinct keys in the aggregation buffer.
    pub aggregation_buffer_keys: IntGauge,
    /// Anchor jobs waiting in the queue.
    pub anchor_queue_depth: IntGauge,
}

impl Metrics {
    /// Creates and registers every metric.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus` error if registration fails (duplicate
    /// names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sync_items_total = IntCounterVec::new(
            Opts::new("sahay_sync_items_total", "Sync batch items by outcome"),
            &["outcome"],
        )?;
        let analytics_events_total = IntCounter::new(
            "sahay_analytics_events_total",
            "Accepted de-identified analytics events",
        )?;
        let escalations_total = IntCounter::new(
            "sahay_escalations_total",
            "Complaints escalated by the SLA scheduler",
        )?;
        let anchor_jobs_total = IntCounterVec::new(
            Opts::new("sahay_anchor_jobs_total", "Anchor job submissions by result"),
            &["result"],
        )?;
        let aggregation_buffer_keys = IntGauge::new(
            "sahay_aggregation_buffer_keys",
            "Distinct keys currently in the aggregation buffer",
        )?;
        let anchor_queue_depth = IntGauge::new(
            "sahay_anchor_queue_depth",
            "Anchor jobs currently queued",
        )?;

        registry.register(Box::new(sync_items_total.clone()))?;
        registry.register(Box::new(analytics_events_total.clone()))?;
        registry.register(Box::new(escalations_total.clone()))?;
        registry.register(Box::new(anchor_jobs_total.clone()))?;
        registry.register(Box::new(aggregation_buffer_keys.clone()))?;
        registry.register(Box::new(anchor_queue_depth.clone()))?;

        Ok(Self {
            registry,
            sync_items_total,
            analytics_events_total,
            escalations_total,
            anchor_jobs_total,
            aggregation_buffer_keys,
            anchor_queue_depth,
        })
    }

    /// Encodes every registered metric in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus` error on encoding failure.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("non-UTF-8 metrics output: {e}")))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics
            .sync_items_total
            .with_label_values(&["accepted"])
            .inc();
        metrics.analytics_events_total.inc();
        metrics.aggregation_buffer_keys.set(7);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("sahay_sync_items_total"));
        assert!(text.contains("sahay_aggregation_buffer_keys 7"));
    }
}
