//! Infrastructure event bus implementations and the queue change publisher.
//!
//! The bus abstraction lives in `hireloop-events` as pure mechanics.
//! This module provides infrastructure-backed implementations (e.g. Redis).

pub mod publisher;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use publisher::{ChangePublisher, PublishMode};
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubBus;
