//! # Notification Sink
//!
//! State changes that the outside world cares about (a message going on
//! the air, coming off it) are published to a sink. Publishing is
//! fire-and-forget: a sink with nobody listening swallows the event, and a
//! sink that fails never rolls back the transition that produced it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::order::Order;

/// Channel carrying transmission start/end events.
pub const TRANSMISSIONS_CHANNEL: &str = "transmissions";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TransmissionStarted {
        uuid: Uuid,
        tx_seq_num: u64,
        message_size: u64,
        bid_per_byte: f64,
    },
    TransmissionEnded {
        uuid: Uuid,
        tx_seq_num: u64,
        message_size: u64,
        /// Wall-clock time the message held the channel.
        duration_secs: f64,
    },
}

impl Notification {
    pub fn started(order: &Order) -> Self {
        Self::TransmissionStarted {
            uuid: order.uuid,
            tx_seq_num: order.tx_seq_num.unwrap_or_default(),
            message_size: order.message_size,
            bid_per_byte: order.bid_per_byte(),
        }
    }

    pub fn ended(order: &Order) -> Self {
        let duration_secs = match (order.started_transmission_at, order.ended_transmission_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        };
        Self::TransmissionEnded {
            uuid: order.uuid,
            tx_seq_num: order.tx_seq_num.unwrap_or_default(),
            message_size: order.message_size,
            duration_secs,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::TransmissionStarted { uuid, .. } | Self::TransmissionEnded { uuid, .. } => *uuid,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn publish(&self, channel: &str, event: &Notification);
}

/// An event as seen by broadcast subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub event: Notification,
}

/// Fans events out over a `tokio::sync::broadcast` channel.
///
/// The host owns the sender's lifecycle: the sink lives as long as the
/// queue that holds it, and subscribers come and go.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Envelope> {
        self.tx.clone()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, channel: &str, event: &Notification) {
        // Err only means nobody is subscribed.
        let _ = self.tx.send(Envelope {
            channel: channel.to_string(),
            event: event.clone(),
        });
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _channel: &str, _event: &Notification) {}
}
