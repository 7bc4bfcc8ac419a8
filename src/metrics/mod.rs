//! Prometheus metrics for Notibus
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Useful for Grafana dashboards, alerts, and capacity planning.

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

mod server;

pub use server::MetricsServer;

/// All Notibus metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_maximum: IntGauge,
    pub connections_by_transport: IntGaugeVec,
    pub connections_rejected_total: IntCounterVec,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,
    pub topics_current: IntGauge,

    // Frame metrics
    pub frames_rejected_total: IntCounterVec,

    // Publish metrics
    pub publishes_total: IntCounter,
    pub publish_fanout: Histogram,
    pub messages_enqueued_total: IntCounter,
    pub messages_dropped_total: IntCounterVec,

    // Delivery metrics
    pub messages_written_total: IntCounter,
    pub messages_bytes_written: IntCounter,
    pub delivery_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = IntCounter::with_opts(Opts::new(
            "notibus_connections_total",
            "Total number of client connections since startup",
        ))
        .unwrap();

        let connections_current = IntGauge::with_opts(Opts::new(
            "notibus_connections_current",
            "Current number of connected clients",
        ))
        .unwrap();

        let connections_maximum = IntGauge::with_opts(Opts::new(
            "notibus_connections_maximum",
            "Maximum concurrent connections since startup",
        ))
        .unwrap();

        let connections_by_transport = IntGaugeVec::new(
            Opts::new(
                "notibus_connections_by_transport",
                "Current connections by transport",
            ),
            &["transport"],
        )
        .unwrap();

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "notibus_connections_rejected_total",
                "Total connections rejected at accept time",
            ),
            &["reason"],
        )
        .unwrap();

        // Subscription metrics
        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "notibus_subscriptions_current",
            "Current number of active subscriptions",
        ))
        .unwrap();

        let subscriptions_total = IntCounter::with_opts(Opts::new(
            "notibus_subscriptions_total",
            "Total subscriptions created since startup",
        ))
        .unwrap();

        let unsubscriptions_total = IntCounter::with_opts(Opts::new(
            "notibus_unsubscriptions_total",
            "Total unsubscriptions since startup",
        ))
        .unwrap();

        let topics_current = IntGauge::with_opts(Opts::new(
            "notibus_topics_current",
            "Current number of topics with at least one subscriber",
        ))
        .unwrap();

        // Frame metrics
        let frames_rejected_total = IntCounterVec::new(
            Opts::new(
                "notibus_frames_rejected_total",
                "Total client frames rejected by reason",
            ),
            &["reason"],
        )
        .unwrap();

        // Publish metrics
        let publishes_total = IntCounter::with_opts(Opts::new(
            "notibus_publishes_total",
            "Total publishes accepted",
        ))
        .unwrap();

        let publish_fanout = Histogram::with_opts(
            HistogramOpts::new(
                "notibus_publish_fanout",
                "Subscribers matched per publish",
            )
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]),
        )
        .unwrap();

        let messages_enqueued_total = IntCounter::with_opts(Opts::new(
            "notibus_messages_enqueued_total",
            "Total frames enqueued for delivery",
        ))
        .unwrap();

        let messages_dropped_total = IntCounterVec::new(
            Opts::new(
                "notibus_messages_dropped_total",
                "Total frames dropped instead of delivered",
            ),
            &["reason"],
        )
        .unwrap();

        // Delivery metrics
        let messages_written_total = IntCounter::with_opts(Opts::new(
            "notibus_messages_written_total",
            "Total frames written to client sockets",
        ))
        .unwrap();

        let messages_bytes_written = IntCounter::with_opts(Opts::new(
            "notibus_messages_bytes_written_total",
            "Total bytes written to client sockets",
        ))
        .unwrap();

        let delivery_latency = Histogram::with_opts(
            HistogramOpts::new(
                "notibus_delivery_latency_seconds",
                "Time from enqueue to socket write",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_current.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_maximum.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_by_transport.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_rejected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_current.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(unsubscriptions_total.clone()))
            .unwrap();
        registry.register(Box::new(topics_current.clone())).unwrap();
        registry
            .register(Box::new(frames_rejected_total.clone()))
            .unwrap();
        registry.register(Box::new(publishes_total.clone())).unwrap();
        registry.register(Box::new(publish_fanout.clone())).unwrap();
        registry
            .register(Box::new(messages_enqueued_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_written_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_bytes_written.clone()))
            .unwrap();
        registry
            .register(Box::new(delivery_latency.clone()))
            .unwrap();

        Metrics {
            registry,
            connections_total,
            connections_current,
            connections_maximum,
            connections_by_transport,
            connections_rejected_total,
            subscriptions_current,
            subscriptions_total,
            unsubscriptions_total,
            topics_current,
            frames_rejected_total,
            publishes_total,
            publish_fanout,
            messages_enqueued_total,
            messages_dropped_total,
            messages_written_total,
            messages_bytes_written,
            delivery_latency,
        }
    }

    // Helper methods for common operations

    pub fn client_connected(&self, transport: &str) {
        self.connections_total.inc();
        self.connections_current.inc();
        self.connections_by_transport
            .with_label_values(&[transport])
            .inc();
        // Update maximum if current exceeds it
        let current = self.connections_current.get();
        let max = self.connections_maximum.get();
        if current > max {
            self.connections_maximum.set(current);
        }
    }

    pub fn client_disconnected(&self, transport: &str) {
        self.connections_current.dec();
        self.connections_by_transport
            .with_label_values(&[transport])
            .dec();
    }

    pub fn connection_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self, count: usize) {
        self.subscriptions_current.sub(count as i64);
        self.unsubscriptions_total.inc_by(count as u64);
    }

    pub fn set_topics_current(&self, count: usize) {
        self.topics_current.set(count as i64);
    }

    pub fn frame_rejected(&self, reason: &str) {
        self.frames_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn publish_dispatched(&self, matched: usize, enqueued: usize) {
        self.publishes_total.inc();
        self.publish_fanout.observe(matched as f64);
        self.messages_enqueued_total.inc_by(enqueued as u64);
    }

    pub fn messages_dropped(&self, reason: &str, count: u64) {
        self.messages_dropped_total
            .with_label_values(&[reason])
            .inc_by(count);
    }

    pub fn message_written(&self, bytes: usize, latency: Duration) {
        self.messages_written_total.inc();
        self.messages_bytes_written.inc_by(bytes as u64);
        self.delivery_latency.observe(latency.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
