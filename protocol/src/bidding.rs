//! # Bid Arithmetic
//!
//! Everything an order is charged for is measured in over-the-air bytes: the
//! message itself plus the framing paid once per fragment. A 1-byte message
//! still occupies a full fragment header, so tiny messages are comparatively
//! expensive per byte of content, and that is the price of the channel.
//!
//! The admission guard compares integers (`bid >= bytes * price`) rather
//! than the floating point `bid_per_byte`, which is only used for ranking and
//! display.

use crate::config::{BidPolicy, Framing};
use crate::error::{QueueError, QueueResult};

/// Over-the-air size of a message of `message_size` bytes.
///
/// `size + ceil(size / max_payload) * overhead_per_fragment`.
pub fn message_size_with_overhead(message_size: u64, framing: &Framing) -> u64 {
    let fragments = message_size.div_ceil(framing.max_payload.max(1));
    message_size + fragments * framing.overhead_per_fragment
}

/// Paid millisatoshis per over-the-air byte.
pub fn bid_per_byte(bid: u64, size_with_overhead: u64) -> f64 {
    if size_with_overhead == 0 {
        return 0.0;
    }
    bid as f64 / size_with_overhead as f64
}

/// The pay guard: does `bid` cover every over-the-air byte at the minimum
/// per-byte price?
pub fn paid_enough(bid: u64, size_with_overhead: u64, policy: &BidPolicy) -> bool {
    bid >= size_with_overhead.saturating_mul(policy.min_per_byte_bid)
}

/// Smallest bid accepted when a new order is created.
pub fn min_bid(message_size: u64, framing: &Framing, policy: &BidPolicy) -> u64 {
    let per_byte = message_size_with_overhead(message_size, framing)
        .saturating_mul(policy.min_per_byte_bid);
    per_byte.max(policy.min_bid)
}

/// Reject a creation bid below [`min_bid`].
pub fn validate_bid(
    bid: u64,
    message_size: u64,
    framing: &Framing,
    policy: &BidPolicy,
) -> QueueResult<()> {
    let min_bid = min_bid(message_size, framing, policy);
    if bid < min_bid {
        return Err(QueueError::InsufficientBid { min_bid, bid });
    }
    Ok(())
}

/// A bump must add something.
pub fn validate_bump(increase: u64) -> QueueResult<()> {
    if increase == 0 {
        return Err(QueueError::InsufficientBid {
            min_bid: 1,
            bid: 0,
        });
    }
    Ok(())
}
