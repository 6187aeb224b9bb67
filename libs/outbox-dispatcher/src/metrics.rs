//! Optional Prometheus metrics for the dispatcher's polling loop.
//!
//! Mirrors the teacher's `transactional_outbox::metrics::OutboxMetrics`
//! shape: one gauge for the current pending backlog (approximated from the
//! most recently fetched batch, since the store exposes no `COUNT(*)`
//! operation), one gauge for the oldest pending record's age, and one
//! counter for total sent messages.

use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct DispatcherMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub sent_total: IntCounter,
}

impl DispatcherMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "mq_outbox_pending",
                "Number of pending outbox records observed in the last poll",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for mq_outbox_pending");

        let oldest_pending_age_seconds = IntGauge::with_opts(
            Opts::new(
                "mq_outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest pending outbox record in the last poll",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for mq_outbox_oldest_pending_age_seconds");

        let sent_total = IntCounter::with_opts(
            Opts::new(
                "mq_outbox_published_total",
                "Total number of outbox records successfully dispatched to the broker",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for mq_outbox_published_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(sent_total.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register dispatcher metric: {e}");
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            sent_total,
        }
    }
}
