// Prometheus metrics for the delivery engine
// Tracks: updates, ledger growth, assignments, access denials, live feeds

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_with_registry, register_int_gauge_with_registry, Counter, Encoder, IntGauge,
    Opts, Registry, TextEncoder,
};

pub struct Metrics {
    pub registry: Registry,

    pub delivery_updates_total: Counter,
    pub tracking_events_total: Counter,
    pub assignments_total: Counter,
    pub access_denied_total: Counter,
    pub feed_subscribers: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let delivery_updates_total = register_counter_with_registry!(
            Opts::new("delivery_updates_total", "Delivery updates committed"),
            registry
        )?;

        let tracking_events_total = register_counter_with_registry!(
            Opts::new("delivery_tracking_events_total", "Tracking events appended to the ledger"),
            registry
        )?;

        let assignments_total = register_counter_with_registry!(
            Opts::new("delivery_assignments_total", "Courier assignments and unassignments"),
            registry
        )?;

        let access_denied_total = register_counter_with_registry!(
            Opts::new("delivery_access_denied_total", "Requests rejected by the access gate"),
            registry
        )?;

        let feed_subscribers = register_int_gauge_with_registry!(
            Opts::new("delivery_feed_subscribers", "Open live feed subscriptions"),
            registry
        )?;

        Ok(Self {
            registry,
            delivery_updates_total,
            tracking_events_total,
            assignments_total,
            access_denied_total,
            feed_subscribers,
        })
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub static METRICS: Lazy<Metrics> = Lazy::new(|| Metrics::new().expect("Failed to create metrics"));
