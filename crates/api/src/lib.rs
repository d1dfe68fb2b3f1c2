//! Socket bridge service: WebSocket endpoint, fan-out bridge, and process wiring.

pub mod app;
pub mod bridge;
pub mod config;
