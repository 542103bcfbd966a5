use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::services::aggregator::Aggregator;
use crate::services::cache::DatasetHealth;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" when every dataset is fresh, "degraded" otherwise)
    pub status: String,
    /// API version
    pub version: String,
    /// Per-dataset refresh health
    pub datasets: Vec<DatasetHealth>,
}

/// Health check endpoint.
///
/// Reports whether the most recent refresh of each dataset succeeded and is
/// still within its TTL. Never triggers an upstream fetch. Returns status
/// "degraded" (still 200) when any dataset is unhealthy, so load balancers
/// can distinguish partial failures.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
    )
)]
pub async fn health_check(State(aggregator): State<Aggregator>) -> Json<HealthResponse> {
    let datasets = aggregator.health().await;
    let all_ok = datasets.iter().all(|d| d.healthy);

    Json(HealthResponse {
        status: if all_ok {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        datasets,
    })
}
