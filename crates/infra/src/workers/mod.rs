//! Background workers.

pub mod subscription_pool;

pub use subscription_pool::{PoolCanceller, PoolError, PoolHandle, PoolStats, SubscriptionPool};
