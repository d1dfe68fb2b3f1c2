//! HTTP/WebSocket application wiring (Axum router + shared state).
//!
//! - `services.rs`: infrastructure wiring (store, bus, publisher, worker)
//! - `routes/`: socket endpoint and system routes
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use hireloop_infra::jobs::ProcessorWorker;

use crate::bridge::OriginPolicy;

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, ServiceError, build_services};

/// Per-request state shared by every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub services: AppServices,
    pub origins: OriginPolicy,
    /// Present when this process runs the Processor Worker.
    pub worker: Option<Arc<ProcessorWorker>>,
}

/// Build the full router (public entrypoint used by `main.rs` and tests).
///
/// The socket endpoint answers on `/` and `/ws`.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::socket::upgrade))
        .route("/ws", get(routes::socket::upgrade))
        .route("/health", get(routes::system::health))
        .route("/queue/stats", get(routes::system::queue_stats))
        .layer(Extension(state))
}
