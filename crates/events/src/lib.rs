//! Queue change events and the pub/sub bus that carries them between processes.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::{DEFAULT_QUEUE_CHANNEL, EnvelopeKind, QueueEnvelope};
pub use in_memory_bus::InMemoryEventBus;
