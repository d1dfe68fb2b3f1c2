//! Infrastructure layer: queue stores, bus adapters, and the processor worker.

pub mod event_bus;
pub mod jobs;
