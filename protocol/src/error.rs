//! Error types for the broadcast queue.
//!
//! Every operation exposed by [`crate::queue::BroadcastQueue`] returns a
//! [`QueueError`]. None of them is fatal to the scheduler: they describe a
//! caller mistake or a single failed item, and the daemon keeps running.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::storage::DbError;

/// A lifecycle event that is not allowed from the current state.
///
/// Produced by the pure transition functions in [`crate::order`] and
/// [`crate::invoice`]. The entity is left untouched when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    /// "order" or "invoice".
    pub entity: &'static str,
    /// Name of the state the entity was in.
    pub from: &'static str,
    /// Name of the rejected event.
    pub event: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} {} in state {}",
            self.event, self.entity, self.from
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Errors surfaced by queue and scheduler operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A state machine guard or precondition was violated.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A confirmation named a region that is not in the catalog.
    #[error("region {0} not found")]
    RegionNotFound(u8),

    /// The offered bid is below the admission price for this message.
    #[error("bid too low: the minimum bid for this message is {min_bid} millisatoshis, got {bid}")]
    InsufficientBid {
        /// Minimum acceptable bid.
        min_bid: u64,
        /// Bid that was offered.
        bid: u64,
    },

    /// No order with this uuid.
    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    /// No invoice with this external reference id.
    #[error("invoice {0} not found")]
    InvoiceNotFound(String),

    /// No order holds this transmission sequence number (in a sendable state).
    #[error("sent order with sequence number {0} not found")]
    SequenceNumberNotFound(u64),

    /// The presented authentication token does not match.
    #[error("invalid authentication token")]
    Unauthorized,

    /// Message below the minimum size.
    #[error("message too small: minimum message size is {min} bytes")]
    MessageTooSmall {
        /// Minimum accepted size.
        min: u64,
    },

    /// Message above the maximum size.
    #[error("message too large: {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge {
        /// Offered size.
        size: u64,
        /// Maximum accepted size.
        max: u64,
    },

    /// The invoice was already paid.
    #[error("invoice already paid")]
    InvoiceAlreadyPaid,

    /// The invoice expired before it was paid.
    #[error("invoice already expired")]
    InvoiceAlreadyExpired,

    /// The invoice points at an order that no longer exists.
    #[error("orphaned invoice {0}")]
    OrphanedInvoice(String),

    /// The payment gateway refused or failed an invoice request.
    #[error("payment gateway error: {0}")]
    Gateway(String),

    /// The payment gateway would not register the invoice webhook.
    #[error("webhook registration failed: {0}")]
    WebhookRegistration(String),

    /// Another scheduler instance holds the data directory.
    #[error("scheduler already running: lock {path} held by pid {}", .pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()))]
    SchedulerLocked {
        /// Lock file path.
        path: String,
        /// PID recorded by the holder, if readable.
        pid: Option<u32>,
    },

    /// Payload store I/O failure.
    #[error("payload store error: {0}")]
    Payload(#[from] std::io::Error),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl QueueError {
    /// Stable numeric code for the error, shared with API clients.
    ///
    /// Storage, payload and lock failures are internal and all map to `1`.
    pub fn code(&self) -> u16 {
        match self {
            Self::InsufficientBid { .. } => 102,
            Self::OrderNotFound(_) => 104,
            Self::Unauthorized => 109,
            Self::Gateway(_) => 110,
            Self::WebhookRegistration(_) => 111,
            Self::InvoiceNotFound(_) => 112,
            Self::SequenceNumberNotFound(_) => 114,
            Self::MessageTooSmall { .. } => 117,
            Self::MessageTooLarge { .. } => 118,
            Self::InvalidTransition(t) if t.event == "cancel" => 120,
            Self::InvalidTransition(t) if t.event == "bump" => 121,
            Self::InvalidTransition(_) => 119,
            Self::OrphanedInvoice(_) => 122,
            Self::InvoiceAlreadyPaid => 123,
            Self::InvoiceAlreadyExpired => 129,
            Self::RegionNotFound(_) => 131,
            Self::SchedulerLocked { .. } | Self::Payload(_) | Self::Storage(_) => 1,
        }
    }

    /// Whether the failure is on the caller's side rather than ours.
    pub fn is_client_error(&self) -> bool {
        self.code() != 1
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
