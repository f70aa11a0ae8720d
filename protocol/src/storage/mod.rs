//! # Storage Module
//!
//! Durable state of the broadcast queue. Message payloads are not kept
//! here; they live in a [`crate::payload::PayloadStore`] and are referenced
//! by order uuid.
//!
//! Bincode is the on-disk format. JSON is for the operator API; bincode is
//! for storage.

pub mod db;

pub use db::{DbError, DbResult, QueueDb};
