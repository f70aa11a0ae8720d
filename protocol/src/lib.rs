// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Skycast Protocol: Core Library
//!
//! Skycast sells airtime on a one-way satellite broadcast channel, one byte
//! at a time. Anyone can upload a message and bid for it; whoever pays the
//! most per over-the-air byte goes next. The channel never waits and never
//! gives refunds for bytes already sent.
//!
//! ## Architecture
//!
//! - **config**: Framing overhead, prices, expiry windows. Every magic number.
//! - **bidding**: Over-the-air size and the per-byte price guard.
//! - **auth**: HMAC tokens for payment webhooks and order owners.
//! - **region**: The beam catalog and the confirmation quorum.
//! - **invoice** / **order**: Lifecycles as pure transition tables.
//! - **confirmation**: Tx/rx facts reported by regions.
//! - **storage**: sled trees holding all of the above.
//! - **payload**: Where message bodies live until they expire.
//! - **notify**: Fire-and-forget event publishing.
//! - **gateway**: The payment processor contract.
//! - **queue**: The service that ties it together, one order lock at a time.
//! - **scheduler**: The daemon that actually puts bytes on the air.
//!
//! ## Design Philosophy
//!
//! 1. State machines are data. Effects run after the state is durable.
//! 2. One writer for sequence numbers, enforced by a file lock, not by hope.
//! 3. A failed cleanup of one order never stops the channel.

pub mod auth;
pub mod bidding;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod gateway;
pub mod invoice;
pub mod notify;
pub mod order;
pub mod payload;
pub mod queue;
pub mod region;
pub mod scheduler;
pub mod storage;

pub use error::{InvalidTransition, QueueError, QueueResult};
pub use queue::{BroadcastQueue, OrderReceipt, ReclaimReport};
pub use scheduler::{Scheduler, SchedulerLock};
