//! Trajectory HTTP endpoints.
//!
//! - GET /api/v1/trajectories?thresholdKm=N
//! - GET /api/v1/trajectories/:id?thresholdKm=N

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};

use crate::errors::{AppError, ErrorResponse};
use crate::models::{Trajectory, TrajectoryPoint};
use crate::services::aggregator::{Aggregator, TrajectoryView};

/// Upper bound for `thresholdKm` (a quarter of the Earth's circumference).
const MAX_THRESHOLD_KM: f64 = 10_000.0;

/// Header set when any dataset was served from an expired cache entry.
pub const STALE_HEADER: &str = "x-data-stale";

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoriesQuery {
    /// Buffer distance around hazards in km (defaults to the configured threshold)
    pub threshold_km: Option<f64>,
}

/// One observed position.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PointResponse {
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude as reported upstream
    pub altitude: f64,
    pub observed_at: DateTime<Utc>,
}

impl From<&TrajectoryPoint> for PointResponse {
    fn from(p: &TrajectoryPoint) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
            altitude: p.altitude,
            observed_at: p.observed_at,
        }
    }
}

/// A trajectory with its monitoring flag.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryResponse {
    /// Positions in chronological order
    pub points: Vec<PointResponse>,
    /// Whether any point lies within the threshold of an active hazard
    pub is_monitoring: bool,
}

impl TrajectoryResponse {
    fn build(trajectory: &Trajectory, view: &TrajectoryView) -> Self {
        Self {
            points: trajectory.points().iter().map(PointResponse::from).collect(),
            is_monitoring: view.is_monitoring(&trajectory.id),
        }
    }
}

fn validate_threshold(threshold_km: Option<f64>) -> Result<Option<f64>, AppError> {
    match threshold_km {
        // NaN fails every range comparison, so check finiteness first.
        Some(t) if !t.is_finite() => Err(AppError::BadRequest(
            "thresholdKm must be a finite number".to_string(),
        )),
        Some(t) if !(0.0..=MAX_THRESHOLD_KM).contains(&t) => Err(AppError::BadRequest(format!(
            "thresholdKm must be between 0 and {}",
            MAX_THRESHOLD_KM as u64
        ))),
        other => Ok(other),
    }
}

fn stale_headers(view: &TrajectoryView) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if view.is_stale {
        headers.insert(STALE_HEADER, axum::http::HeaderValue::from_static("true"));
    }
    headers
}

/// List all tracked trajectories with their monitoring flag.
///
/// Returns a mapping of trajectory id to its points and whether it is
/// currently within the buffer of an active hazard. If hazards cannot be
/// loaded, every flag is false. Data served from an expired cache entry is
/// marked with `X-Data-Stale: true`.
#[utoipa::path(
    get,
    path = "/api/v1/trajectories",
    tag = "Trajectories",
    params(TrajectoriesQuery),
    responses(
        (status = 200, description = "Trajectories keyed by id",
         body = BTreeMap<String, TrajectoryResponse>,
         headers(
             ("X-Data-Stale" = String,
              description = "Set to 'true' when serving cached data after a failed refresh")
         )),
        (status = 400, description = "Invalid thresholdKm", body = ErrorResponse),
        (status = 503, description = "No trajectory data available", body = ErrorResponse),
    )
)]
pub async fn list_trajectories(
    State(aggregator): State<Aggregator>,
    Query(params): Query<TrajectoriesQuery>,
) -> Result<(HeaderMap, Json<BTreeMap<String, TrajectoryResponse>>), AppError> {
    let threshold_km = validate_threshold(params.threshold_km)?;
    let view = aggregator.trajectory_view(threshold_km).await?;

    let body = view
        .trajectories
        .snapshot
        .data
        .iter()
        .map(|t| (t.id.clone(), TrajectoryResponse::build(t, &view)))
        .collect();

    Ok((stale_headers(&view), Json(body)))
}

/// Get one trajectory by id.
#[utoipa::path(
    get,
    path = "/api/v1/trajectories/{id}",
    tag = "Trajectories",
    params(
        ("id" = String, Path, description = "Trajectory id"),
        TrajectoriesQuery,
    ),
    responses(
        (status = 200, description = "The trajectory", body = TrajectoryResponse),
        (status = 400, description = "Invalid thresholdKm", body = ErrorResponse),
        (status = 404, description = "Unknown trajectory id", body = ErrorResponse),
        (status = 503, description = "No trajectory data available", body = ErrorResponse),
    )
)]
pub async fn get_trajectory(
    State(aggregator): State<Aggregator>,
    Path(id): Path<String>,
    Query(params): Query<TrajectoriesQuery>,
) -> Result<(HeaderMap, Json<TrajectoryResponse>), AppError> {
    let threshold_km = validate_threshold(params.threshold_km)?;
    let view = aggregator.trajectory_view(threshold_km).await?;

    let trajectory = view
        .trajectories
        .snapshot
        .data
        .iter()
        .find(|t| t.id == id)
        .ok_or_else(|| AppError::NotFound(format!("Trajectory {} not found", id)))?;

    Ok((
        stale_headers(&view),
        Json(TrajectoryResponse::build(trajectory, &view)),
    ))
}
