//! # Orders
//!
//! An order is a request to put one message on the air. It is created
//! `pending` with its first invoice, becomes `paid` once paid invoices cover
//! every over-the-air byte, and is then picked up by the scheduler in
//! descending bid-per-byte order.
//!
//! ```text
//!            ┌──cancel──▶ cancelled ◀──cancel──┐
//!            │                                 │
//! pending ──pay──▶ paid ──transmit──▶ transmitting ──end──▶ sent ──receive──▶ received
//!    │
//!    └──expire──▶ expired
//! ```
//!
//! `bump` and repeated `pay` are self-loops on `pending` and `paid`.
//!
//! The table in [`transition`] is pure: it knows nothing about storage,
//! payloads or the notification bus. Callers get the effects back as data
//! and run them after the new state is committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bidding;
use crate::error::InvalidTransition;
use crate::invoice::{Invoice, InvoiceStatus};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Transmitting,
    Sent,
    Received,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        Self::Pending,
        Self::Paid,
        Self::Transmitting,
        Self::Sent,
        Self::Received,
        Self::Cancelled,
        Self::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Transmitting => "transmitting",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Prefix byte of the status index.
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Whether the message was (or is being) put on the air.
    pub fn is_on_air(&self) -> bool {
        matches!(self, Self::Transmitting | Self::Sent | Self::Received)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Events & Effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    /// Re-evaluate payment. `paid_enough` is the result of the bid guard
    /// computed from freshly adjusted bids.
    Pay { paid_enough: bool },
    /// Go on the air with the given sequence number.
    Transmit { tx_seq_num: u64 },
    EndTransmission,
    /// Caller has established that the confirmation quorum is met.
    Receive,
    Cancel,
    Expire,
    Bump,
}

impl OrderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pay { .. } => "pay",
            Self::Transmit { .. } => "transmit",
            Self::EndTransmission => "end_transmission",
            Self::Receive => "receive",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
            Self::Bump => "bump",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEffect {
    // before-enter
    AssignTxSeqNum(u64),
    RecordStartedAt,
    RecordEndedAt,
    RecordCancelledAt,
    // after-enter
    PublishTransmissionStarted,
    PublishTransmissionEnded,
    DeletePayload,
    SynthesizePresumedRx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub before: Vec<OrderEffect>,
    pub after: Vec<OrderEffect>,
}

impl OrderTransition {
    fn stay(status: OrderStatus) -> Self {
        Self {
            from: status,
            to: status,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// True when the status moved.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// The order transition table.
///
/// A `Pay` whose guard fails is not an error: the order simply stays where
/// it is.
pub fn transition(
    status: OrderStatus,
    event: OrderEvent,
) -> Result<OrderTransition, InvalidTransition> {
    use OrderEffect::*;
    use OrderStatus::*;

    let moved = |to, before: Vec<OrderEffect>, after: Vec<OrderEffect>| OrderTransition {
        from: status,
        to,
        before,
        after,
    };

    let t = match (status, event) {
        (Pending, OrderEvent::Pay { paid_enough: true }) => moved(Paid, vec![], vec![]),
        (Pending | Paid, OrderEvent::Pay { .. }) => OrderTransition::stay(status),
        (Pending | Paid, OrderEvent::Bump) => OrderTransition::stay(status),
        (Paid, OrderEvent::Transmit { tx_seq_num }) => moved(
            Transmitting,
            vec![AssignTxSeqNum(tx_seq_num), RecordStartedAt],
            vec![PublishTransmissionStarted],
        ),
        (Transmitting, OrderEvent::EndTransmission) => {
            moved(Sent, vec![RecordEndedAt], vec![PublishTransmissionEnded])
        }
        (Sent, OrderEvent::Receive) => moved(Received, vec![], vec![SynthesizePresumedRx]),
        (Pending | Paid, OrderEvent::Cancel) => {
            moved(Cancelled, vec![RecordCancelledAt], vec![DeletePayload])
        }
        (Pending, OrderEvent::Expire) => moved(Expired, vec![], vec![DeletePayload]),
        _ => {
            return Err(InvalidTransition {
                entity: "order",
                from: status.as_str(),
                event: event.as_str(),
            })
        }
    };
    Ok(t)
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub uuid: Uuid,
    pub message_size: u64,
    /// Hex SHA-256 of the message.
    pub message_digest: String,
    /// Sum of paid invoice amounts.
    pub bid: u64,
    /// Sum of pending invoice amounts.
    pub unpaid_bid: u64,
    /// Over-the-air size, fixed at creation.
    pub size_with_overhead: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub started_transmission_at: Option<DateTime<Utc>>,
    pub ended_transmission_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub tx_seq_num: Option<u64>,
}

impl Order {
    pub fn new(
        message_size: u64,
        message_digest: String,
        size_with_overhead: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            message_size,
            message_digest,
            bid: 0,
            unpaid_bid: 0,
            size_with_overhead,
            status: OrderStatus::Pending,
            created_at: now,
            started_transmission_at: None,
            ended_transmission_at: None,
            cancelled_at: None,
            tx_seq_num: None,
        }
    }

    /// Paid millisatoshis per over-the-air byte.
    pub fn bid_per_byte(&self) -> f64 {
        bidding::bid_per_byte(self.bid, self.size_with_overhead)
    }

    /// Recompute `bid` and `unpaid_bid` from the order's invoices.
    pub fn adjust_bids<'a>(&mut self, invoices: impl IntoIterator<Item = &'a Invoice>) {
        let (mut paid, mut unpaid) = (0u64, 0u64);
        for invoice in invoices {
            match invoice.status {
                InvoiceStatus::Paid => paid = paid.saturating_add(invoice.amount),
                InvoiceStatus::Pending => unpaid = unpaid.saturating_add(invoice.amount),
                InvoiceStatus::Expired => {}
            }
        }
        self.bid = paid;
        self.unpaid_bid = unpaid;
    }

    /// Move the order, running the before-enter effects on its own fields.
    ///
    /// Returns the transition so the caller can run the after-enter
    /// effects once the new state is durable. On error the order is
    /// untouched.
    pub fn apply(
        &mut self,
        event: OrderEvent,
        now: DateTime<Utc>,
    ) -> Result<OrderTransition, InvalidTransition> {
        let t = transition(self.status, event)?;
        for effect in &t.before {
            match *effect {
                OrderEffect::AssignTxSeqNum(seq) => self.tx_seq_num = Some(seq),
                OrderEffect::RecordStartedAt => self.started_transmission_at = Some(now),
                OrderEffect::RecordEndedAt => self.ended_transmission_at = Some(now),
                OrderEffect::RecordCancelledAt => self.cancelled_at = Some(now),
                _ => {}
            }
        }
        self.status = t.to;
        Ok(t)
    }
}
