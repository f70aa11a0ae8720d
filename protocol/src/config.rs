//! # Queue Configuration & Constants
//!
//! Every magic number in skycast lives here. The framing constants describe
//! how a message is actually carried over the air, the timing constants
//! describe how long work is allowed to linger, and the config structs group
//! the tunables the node binary exposes on its command line.
//!
//! Changing the framing constants changes what every existing order is worth
//! per byte, so treat them as part of the pricing contract, not as knobs.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Over-the-air Framing
// ---------------------------------------------------------------------------

/// Layer-2 MTU of the broadcast link.
pub const L2_MTU: u64 = 1500;

/// IPv4 (20) + UDP (8) headers carried by every fragment.
pub const UDP_IP_HEADER_SIZE: u64 = 20 + 8;

/// Application-level fragment header. Fragmentation happens here, not at
/// the IP layer.
pub const FRAGMENT_HEADER_SIZE: u64 = 8;

/// Multi-protocol encapsulation header added by the modulator.
pub const MPE_HEADER_SIZE: u64 = 16;

/// Largest message chunk that fits in one fragment without IP fragmentation.
pub const MAX_FRAGMENT_PAYLOAD: u64 = L2_MTU - (UDP_IP_HEADER_SIZE + FRAGMENT_HEADER_SIZE);

/// Bytes of framing paid once per fragment.
pub const OVERHEAD_PER_FRAGMENT: u64 = MPE_HEADER_SIZE + UDP_IP_HEADER_SIZE + FRAGMENT_HEADER_SIZE;

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Minimum price per over-the-air byte, in millisatoshis.
pub const MIN_PER_BYTE_BID: u64 = 1;

/// Absolute floor for the first invoice of an order, in millisatoshis.
pub const MIN_BID: u64 = 1000;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Default channel capacity in bytes per second.
pub const DEFAULT_TRANSMIT_RATE: u64 = 1000;

/// Longest time a single message may hold the channel. Together with the
/// transmit rate this bounds the maximum message size.
pub const MAX_HEAD_OF_LINE_BLOCKING: Duration = Duration::from_secs(1050);

/// Messages smaller than this are rejected at upload.
pub const MIN_MESSAGE_SIZE: u64 = 1;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

const ONE_HOUR: u64 = 60 * 60;
const ONE_DAY: u64 = 24 * ONE_HOUR;

/// Lifetime of a payment invoice before the duty cycle expires it.
pub const INVOICE_EXPIRY: Duration = Duration::from_secs(ONE_HOUR);

/// Pending orders older than this are expired by the duty cycle.
pub const EXPIRE_PENDING_ORDERS_AFTER: Duration = Duration::from_secs(ONE_DAY);

/// How long a transmitted message stays retrievable before its payload is
/// deleted.
pub const MESSAGE_RETENTION: Duration = Duration::from_secs(31 * ONE_DAY);

/// Period of the reclamation pass run from the dequeue phase.
pub const CLEANUP_DUTY_CYCLE: Duration = Duration::from_secs(5 * 60);

/// Pause between two dequeue polls when nothing is sendable.
pub const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Default number of orders returned by a listing.
pub const PAGE_SIZE: usize = 20;

/// Upper bound on a listing's `limit`.
pub const MAX_PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

/// Description attached to every invoice requested from the gateway.
pub const INVOICE_DESCRIPTION: &str = "skycast broadcast transmission";

/// Root used to build webhook callback URLs when none is configured.
pub const DEFAULT_CALLBACK_ROOT: &str = "http://127.0.0.1:9292";

// ---------------------------------------------------------------------------
// Config Structs
// ---------------------------------------------------------------------------

/// How a message is cut into fragments on the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    /// Payload bytes per fragment.
    pub max_payload: u64,
    /// Framing bytes added to every fragment.
    pub overhead_per_fragment: u64,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            max_payload: MAX_FRAGMENT_PAYLOAD,
            overhead_per_fragment: OVERHEAD_PER_FRAGMENT,
        }
    }
}

/// Admission prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidPolicy {
    /// Minimum accepted bid per over-the-air byte.
    pub min_per_byte_bid: u64,
    /// Floor applied to the bid of a new order regardless of its size.
    pub min_bid: u64,
}

impl Default for BidPolicy {
    fn default() -> Self {
        Self {
            min_per_byte_bid: MIN_PER_BYTE_BID,
            min_bid: MIN_BID,
        }
    }
}

/// Tunables for the order/invoice service.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub framing: Framing,
    pub bids: BidPolicy,
    /// Smallest accepted message.
    pub min_message_size: u64,
    /// Largest accepted message, bounding head-of-line blocking.
    pub max_message_size: u64,
    /// Invoice lifetime.
    pub invoice_expiry: Duration,
    /// Maximum age of an order left in `pending`.
    pub pending_order_ttl: Duration,
    /// Retention of transmitted payloads.
    pub message_retention: Duration,
    /// Root of the webhook callback URL handed to the payment gateway.
    pub callback_root: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            bids: BidPolicy::default(),
            min_message_size: MIN_MESSAGE_SIZE,
            max_message_size: max_message_size(DEFAULT_TRANSMIT_RATE),
            invoice_expiry: INVOICE_EXPIRY,
            pending_order_ttl: EXPIRE_PENDING_ORDERS_AFTER,
            message_retention: MESSAGE_RETENTION,
            callback_root: DEFAULT_CALLBACK_ROOT.to_string(),
        }
    }
}

/// Tunables for the scheduler daemon.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Channel capacity in bytes per second. Must be non-zero.
    pub transmit_rate: u64,
    /// Period of the reclamation pass.
    pub duty_cycle: Duration,
    /// Pause between dequeue polls.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            transmit_rate: DEFAULT_TRANSMIT_RATE,
            duty_cycle: CLEANUP_DUTY_CYCLE,
            poll_interval: DEQUEUE_POLL_INTERVAL,
        }
    }
}

/// Largest message the channel accepts at the given rate.
pub fn max_message_size(transmit_rate: u64) -> u64 {
    MAX_HEAD_OF_LINE_BLOCKING.as_secs() * transmit_rate
}
