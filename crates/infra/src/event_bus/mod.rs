//! Broker implementations of the persistent-subscription contract.
//!
//! The contract itself lives in `custos-events`; the in-memory hub there serves tests
//! and single-process runs. This module adds the Redis Streams broker.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreams, RedisStreamsError, RedisStreamsSubscription};
