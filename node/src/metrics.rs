//! # Prometheus Metrics
//!
//! Exposes operational metrics for the broadcast channel. Scraped by
//! Prometheus at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.
//!
//! Transmission counters are driven by [`MetricsSink`], which sits in front
//! of the event bus and sees every notification the queue publishes. Queue
//! depth gauges are sampled from storage by [`NodeMetrics::observe_queue`].

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use skycast_protocol::notify::{Notification, NotificationSink};
use skycast_protocol::order::OrderStatus;
use skycast_protocol::BroadcastQueue;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are reference-counted) so it can be
/// shared across request handlers and background tasks.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Messages that went on the air.
    pub transmissions_started_total: IntCounter,
    /// Messages that came off the air.
    pub transmissions_ended_total: IntCounter,
    /// Message bytes (without framing) put on the air.
    pub bytes_transmitted_total: IntCounter,
    /// Highest transmission sequence number assigned.
    pub last_tx_seq_num: IntGauge,
    /// Orders waiting in `paid`.
    pub queued_orders: IntGauge,
    /// Orders waiting in `pending`.
    pub pending_orders: IntGauge,
    /// Wall-clock time a message held the channel.
    pub transmission_duration_seconds: Histogram,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> prometheus::Result<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("skycast".into()), None)?;

        let transmissions_started_total = register(
            &registry,
            IntCounter::new("transmissions_started_total", "Messages put on the air")?,
        )?;
        let transmissions_ended_total = register(
            &registry,
            IntCounter::new("transmissions_ended_total", "Messages whose transmission finished")?,
        )?;
        let bytes_transmitted_total = register(
            &registry,
            IntCounter::new("bytes_transmitted_total", "Message bytes put on the air")?,
        )?;
        let last_tx_seq_num = register(
            &registry,
            IntGauge::new("last_tx_seq_num", "Highest transmission sequence number assigned")?,
        )?;
        let queued_orders = register(
            &registry,
            IntGauge::new("queued_orders", "Paid orders waiting for the channel")?,
        )?;
        let pending_orders = register(
            &registry,
            IntGauge::new("pending_orders", "Orders waiting for payment")?,
        )?;
        let transmission_duration_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "transmission_duration_seconds",
                    "Time a message held the broadcast channel",
                )
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1050.0]),
            )?,
        )?;

        Ok(Self {
            registry,
            transmissions_started_total,
            transmissions_ended_total,
            bytes_transmitted_total,
            last_tx_seq_num,
            queued_orders,
            pending_orders,
            transmission_duration_seconds,
        })
    }

    /// Record one published event.
    pub fn record(&self, event: &Notification) {
        match event {
            Notification::TransmissionStarted {
                tx_seq_num,
                message_size,
                ..
            } => {
                self.transmissions_started_total.inc();
                self.bytes_transmitted_total.inc_by(*message_size);
                self.last_tx_seq_num.set(*tx_seq_num as i64);
            }
            Notification::TransmissionEnded { duration_secs, .. } => {
                self.transmissions_ended_total.inc();
                self.transmission_duration_seconds.observe(*duration_secs);
            }
        }
    }

    /// Sample queue depth from storage.
    pub fn observe_queue(&self, queue: &BroadcastQueue) {
        let counts = queue.status_counts();
        let depth = |status| counts.get(&status).copied().unwrap_or(0) as i64;
        self.queued_orders.set(depth(OrderStatus::Paid));
        self.pending_orders.set(depth(OrderStatus::Pending));
        match queue.last_tx_seq_num() {
            Ok(Some(seq)) => self.last_tx_seq_num.set(seq as i64),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to read last sequence number"),
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Counts every event, then hands it to the wrapped sink.
pub struct MetricsSink {
    metrics: SharedMetrics,
    inner: Arc<dyn NotificationSink>,
}

impl MetricsSink {
    pub fn new(metrics: SharedMetrics, inner: Arc<dyn NotificationSink>) -> Self {
        Self { metrics, inner }
    }
}

impl NotificationSink for MetricsSink {
    fn publish(&self, channel: &str, event: &Notification) {
        self.metrics.record(event);
        self.inner.publish(channel, event);
    }
}

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skycast_protocol::notify::{BroadcastSink, TRANSMISSIONS_CHANNEL};
    use uuid::Uuid;

    fn started(seq: u64, size: u64) -> Notification {
        Notification::TransmissionStarted {
            uuid: Uuid::new_v4(),
            tx_seq_num: seq,
            message_size: size,
            bid_per_byte: 1.0,
        }
    }

    #[test]
    fn metrics_register_under_skycast_prefix() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.transmissions_started_total.inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("skycast_transmissions_started_total 1"));
        assert!(text.contains("skycast_transmission_duration_seconds"));
    }

    #[tokio::test]
    async fn sink_records_then_forwards() {
        let metrics = Arc::new(NodeMetrics::new().unwrap());
        let bus = BroadcastSink::new(8);
        let mut rx = bus.subscribe();
        let sink = MetricsSink::new(metrics.clone(), Arc::new(bus));

        sink.publish(TRANSMISSIONS_CHANNEL, &started(7, 500));
        sink.publish(
            TRANSMISSIONS_CHANNEL,
            &Notification::TransmissionEnded {
                uuid: Uuid::new_v4(),
                tx_seq_num: 7,
                message_size: 500,
                duration_secs: 0.5,
            },
        );

        assert_eq!(metrics.transmissions_started_total.get(), 1);
        assert_eq!(metrics.transmissions_ended_total.get(), 1);
        assert_eq!(metrics.bytes_transmitted_total.get(), 500);
        assert_eq!(metrics.last_tx_seq_num.get(), 7);
        assert_eq!(metrics.transmission_duration_seconds.get_sample_count(), 1);

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.channel, TRANSMISSIONS_CHANNEL);
    }
}
