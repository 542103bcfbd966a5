//! Canonical records produced by the source adapters.
//!
//! All values are immutable once constructed. A refresh builds new values and
//! replaces the whole snapshot; nothing here is edited in place.

use chrono::{DateTime, Utc};
use geo::Polygon;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

use crate::services::sources::FetchFailure;

/// One observed position of a tracked object.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude as reported upstream, never negative.
    pub altitude: f64,
    pub observed_at: DateTime<Utc>,
}

impl TrajectoryPoint {
    /// Build a point, returning `None` if any coordinate is non-finite or
    /// out of range.
    pub fn new(
        latitude: f64,
        longitude: f64,
        altitude: f64,
        observed_at: DateTime<Utc>,
    ) -> Option<Self> {
        if !crate::helpers::is_valid_lat_lon(latitude, longitude)
            || !altitude.is_finite()
            || altitude < 0.0
        {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
            altitude,
            observed_at,
        })
    }
}

/// Time-ordered path of one tracked object.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub id: String,
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    /// Build a trajectory from points in any order. Points are sorted by
    /// `observed_at` (stable, so equal timestamps keep their input order).
    /// Returns `None` for an empty point list.
    pub fn new(id: impl Into<String>, mut points: Vec<TrajectoryPoint>) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        points.sort_by_key(|p| p.observed_at);
        Some(Self {
            id: id.into(),
            points,
        })
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    /// Most recent point.
    pub fn latest(&self) -> &TrajectoryPoint {
        // Non-empty by construction.
        &self.points[self.points.len() - 1]
    }

    pub fn latest_observed_at(&self) -> DateTime<Utc> {
        self.latest().observed_at
    }
}

/// Alert severity as published by the hazard feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, ToSchema)]
pub enum Severity {
    Extreme,
    Severe,
    Moderate,
    Minor,
    Unknown,
}

impl Severity {
    /// Parse an upstream severity string, case-insensitively. Anything
    /// unrecognised maps to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "extreme" => Severity::Extreme,
            "severe" => Severity::Severe,
            "moderate" => Severity::Moderate,
            "minor" => Severity::Minor,
            _ => Severity::Unknown,
        }
    }
}

/// A geographic region under an active alert.
#[derive(Debug, Clone, PartialEq)]
pub struct HazardArea {
    pub id: String,
    /// Outer ring with x = longitude and y = latitude, as published
    /// upstream. Holes are not carried.
    pub boundary: Polygon<f64>,
    pub severity: Severity,
    /// Display-only fields (event, headline, ...). Never read by the classifier.
    pub metadata: BTreeMap<String, String>,
}

/// The two logical datasets served by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Trajectories,
    Hazards,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Trajectories => write!(f, "trajectories"),
            DatasetKind::Hazards => write!(f, "hazards"),
        }
    }
}

/// Result of one aggregation round. Shared as `Arc<DatasetSnapshot<T>>` and
/// never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSnapshot<T> {
    pub data: Vec<T>,
    pub fetched_at: DateTime<Utc>,
    /// Sources that failed this round, keyed by source id.
    pub source_errors: BTreeMap<String, FetchFailure>,
}
