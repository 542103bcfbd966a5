//! GET /api/v1/hazards — active hazard areas with boundary and severity.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::errors::{AppError, ErrorResponse};
use crate::models::{HazardArea, Severity};
use crate::routes::trajectories::STALE_HEADER;
use crate::services::aggregator::Aggregator;

/// One hazard area.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HazardResponse {
    pub id: String,
    pub severity: Severity,
    /// Ring of [longitude, latitude] pairs as published upstream
    pub boundary: Vec<Vec<f64>>,
    /// Display fields (event, headline, areaDesc, onset, expires, senderName)
    pub metadata: BTreeMap<String, String>,
}

impl From<&HazardArea> for HazardResponse {
    fn from(h: &HazardArea) -> Self {
        Self {
            id: h.id.clone(),
            severity: h.severity,
            boundary: h
                .boundary
                .exterior()
                .coords()
                .map(|c| vec![c.x, c.y])
                .collect(),
            metadata: h.metadata.clone(),
        }
    }
}

/// List active hazard areas.
#[utoipa::path(
    get,
    path = "/api/v1/hazards",
    tag = "Hazards",
    responses(
        (status = 200, description = "Active hazard areas", body = Vec<HazardResponse>,
         headers(
             ("X-Data-Stale" = String,
              description = "Set to 'true' when serving cached data after a failed refresh")
         )),
        (status = 503, description = "No hazard data available", body = ErrorResponse),
    )
)]
pub async fn list_hazards(
    State(aggregator): State<Aggregator>,
) -> Result<(HeaderMap, Json<Vec<HazardResponse>>), AppError> {
    let hazards = aggregator.get_hazards().await?;

    let mut headers = HeaderMap::new();
    if hazards.is_stale {
        headers.insert(STALE_HEADER, HeaderValue::from_static("true"));
    }

    Ok((
        headers,
        Json(hazards.snapshot.data.iter().map(HazardResponse::from).collect()),
    ))
}
