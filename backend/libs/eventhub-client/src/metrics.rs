//! Prometheus metrics for the event hub client
//!
//! Not wired to any HTTP exporter — that's left to the host application, the
//! same way `db-pool`'s metrics are a library concern, not a service concern.

use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

lazy_static::lazy_static! {
    /// Events published, by publisher/event_type
    pub static ref EVENTS_PUBLISHED: IntCounterVec = register_int_counter_vec!(
        "eventhub_events_published_total",
        "Events published",
        &["publisher", "event_type"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Events dispatched to a callback, by subscriber/channel/outcome
    pub static ref EVENTS_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        "eventhub_events_dispatched_total",
        "Events dispatched to a subscriber callback",
        &["subscriber", "channel", "outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Attempts that observed a lease already held by another process
    pub static ref LEASE_CONTENDED: IntCounterVec = register_int_counter_vec!(
        "eventhub_lease_contended_total",
        "Processing attempts that lost the lease race",
        &["subscriber", "channel"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Listener reconnects, by subscriber
    pub static ref LISTENER_RECONNECTS: IntCounterVec = register_int_counter_vec!(
        "eventhub_listener_reconnects_total",
        "Listener connection re-establishments",
        &["subscriber"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Active per-event-type workers, by subscriber
    pub static ref ACTIVE_WORKERS: IntGaugeVec = register_int_gauge_vec!(
        "eventhub_active_workers",
        "Currently running per-event-type workers",
        &["subscriber"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub fn record_dispatch(subscriber: &str, channel: &str, outcome: &str) {
    EVENTS_DISPATCHED
        .with_label_values(&[subscriber, channel, outcome])
        .inc();
}

pub fn record_lease_contention(subscriber: &str, channel: &str) {
    LEASE_CONTENDED.with_label_values(&[subscriber, channel]).inc();
}

pub fn record_reconnect(subscriber: &str) {
    LISTENER_RECONNECTS.with_label_values(&[subscriber]).inc();
}

pub fn set_active_workers(subscriber: &str, count: i64) {
    ACTIVE_WORKERS.with_label_values(&[subscriber]).set(count);
}
