//! The `persistence` module provides durable storage for the embedded log
//! broker, so records survive a restart and can be fetched again by offset.
//!
//! It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{LogStore, StoredPartition};
