use std::collections::BTreeMap;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use hireloop_core::JobStatus;

use crate::app::AppState;
use crate::app::errors::store_error_to_response;

/// Liveness plus component health; always 200 while the process serves.
pub async fn health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.services.health.report()))
}

/// GET /queue/stats
///
/// Job counts by status from the store, this process's worker statistics
/// (null when it runs no worker), and the number of local socket connections.
pub async fn queue_stats(Extension(state): Extension<AppState>) -> axum::response::Response {
    let jobs = match state.services.store.snapshot().await {
        Ok(jobs) => jobs,
        Err(e) => return store_error_to_response(e),
    };

    let mut by_status: BTreeMap<&'static str, usize> =
        JobStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for job in &jobs {
        *by_status.entry(job.status.as_str()).or_default() += 1;
    }

    let worker = state.worker.as_ref().map(|w| {
        json!({
            "name": w.config().name.as_str(),
            "stats": w.stats(),
            "paused": w.is_paused(),
        })
    });

    Json(json!({
        "jobs": {
            "total": jobs.len(),
            "byStatus": by_status,
        },
        "worker": worker,
        "health": state.services.health.report(),
        "connections": state.services.registry.len(),
    }))
    .into_response()
}
