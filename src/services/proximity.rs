//! Hazard proximity classifier.
//!
//! A trajectory is "monitoring" when any of its points lies inside the
//! buffer of any hazard: either inside the hazard ring itself, or within
//! `threshold_km` great-circle distance of the ring boundary. The boundary
//! test is inclusive (distance == threshold counts).
//!
//! Ring edges are straight lines in the lon/lat plane for both tests, so the
//! buffer hugs the polygon as drawn. Inside is `geo`'s point-in-polygon test;
//! the boundary distance is the haversine distance to the nearest edge point.
//!
//! Each hazard is prepared exactly once per classification pass:
//! 1. Ring normalised (closing vertex and consecutive duplicates dropped)
//! 2. Longitudes unwrapped so rings crossing ±180° are continuous
//! 3. A conservative lat/lon envelope, grown by the threshold, for cheap
//!    rejection of far-away points
//!
//! Rings that wind a full 360° of longitude enclose a pole. A lon/lat
//! polygon cannot represent them, so they are rejected as malformed and the
//! hazard is skipped.

use geo::{
    BoundingRect, Closest, ClosestPoint, Coord, Intersects, Line, LineString, Point, Polygon, Rect,
};
use std::collections::BTreeSet;

use crate::helpers::{haversine_km, is_valid_lat_lon, km_to_degrees};
use crate::models::{HazardArea, Trajectory};

/// Default buffer distance around each hazard.
pub const DEFAULT_THRESHOLD_KM: f64 = 100.0;

/// Relative slack on the envelope so points exactly at the threshold are
/// never rejected before the exact distance test.
const ENVELOPE_SLACK: f64 = 1e-9;

/// Floor for the cos(lat) longitude scale; keeps the projection invertible
/// at the poles.
const MIN_LON_SCALE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProximityError {
    #[error("ring has {0} distinct vertices, need at least 3")]
    TooFewVertices(usize),
    #[error("vertex ({lon}, {lat}) is non-finite or out of range")]
    InvalidVertex { lon: f64, lat: f64 },
    #[error("ring encloses a pole")]
    EnclosesPole,
    #[error("threshold must be a finite, non-negative number of km, got {0}")]
    InvalidThreshold(f64),
}

/// Lat/lon box containing the whole buffered region.
#[derive(Debug, Clone, Copy)]
struct Envelope {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    /// The buffer reaches a pole, so every longitude is possible.
    lon_unbounded: bool,
}

impl Envelope {
    fn around(bounds: Rect<f64>, threshold_km: f64) -> Self {
        let delta_deg = km_to_degrees(threshold_km) * (1.0 + ENVELOPE_SLACK) + ENVELOPE_SLACK;
        let min_lat = bounds.min().y - delta_deg;
        let max_lat = bounds.max().y + delta_deg;
        let (min_lon, max_lon) = (bounds.min().x, bounds.max().x);

        let unbounded = Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
            lon_unbounded: true,
        };
        if delta_deg >= 90.0 || max_lat >= 90.0 || min_lat <= -90.0 {
            return unbounded;
        }

        // A circle of angular radius delta centred at latitude phi spans at
        // most asin(sin(delta) / cos(phi)) of longitude either side.
        let phi = min_lat.abs().max(max_lat.abs()).to_radians();
        let spread = delta_deg.to_radians().sin() / phi.cos();
        if spread >= 1.0 {
            return unbounded;
        }
        let dlon = spread.asin().to_degrees() * (1.0 + ENVELOPE_SLACK) + ENVELOPE_SLACK;

        Self {
            min_lon: min_lon - dlon,
            max_lon: max_lon + dlon,
            lon_unbounded: false,
            ..unbounded
        }
    }

    fn admits_lat(&self, lat: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat
    }

    fn admits_lon(&self, lon: f64) -> bool {
        self.lon_unbounded || (lon >= self.min_lon && lon <= self.max_lon)
    }
}

/// A hazard prepared for repeated point tests at a fixed threshold.
struct BufferedHazard {
    /// Normalised outer ring with unwrapped longitudes.
    polygon: Polygon<f64>,
    envelope: Envelope,
    threshold_km: f64,
}

impl BufferedHazard {
    fn prepare(hazard: &HazardArea, threshold_km: f64) -> Result<Self, ProximityError> {
        validate_threshold(threshold_km)?;
        let ring = unwrap_ring(normalize_ring(hazard.boundary.exterior())?)?;
        let polygon = Polygon::new(LineString::new(ring), vec![]);
        let bounds = polygon
            .bounding_rect()
            .ok_or(ProximityError::TooFewVertices(0))?;

        Ok(Self {
            envelope: Envelope::around(bounds, threshold_km),
            polygon,
            threshold_km,
        })
    }

    /// True if (lat, lon) lies in the buffered region. The point is tried at
    /// `lon` and one turn either side to meet rings unwrapped past ±180°.
    fn contains(&self, lat: f64, lon: f64) -> bool {
        if !self.envelope.admits_lat(lat) {
            return false;
        }
        let candidates: Vec<Point<f64>> = [lon, lon + 360.0, lon - 360.0]
            .into_iter()
            .filter(|&l| self.envelope.admits_lon(l))
            .map(|l| Point::new(l, lat))
            .collect();
        if candidates.iter().any(|p| self.polygon.intersects(p)) {
            return true;
        }
        candidates
            .into_iter()
            .map(|p| self.nearest_edge_km(p))
            .any(|d| d <= self.threshold_km)
    }

    /// Haversine distance from `p` to the nearest point on any ring edge.
    /// The nearest point is found in the lon/lat plane with longitudes
    /// scaled by cos(lat) at `p`.
    fn nearest_edge_km(&self, p: Point<f64>) -> f64 {
        let k = p.y().to_radians().cos().max(MIN_LON_SCALE);
        let project = |c: Coord<f64>| Coord { x: c.x * k, y: c.y };
        let target = Point::from(project(p.0));

        self.polygon
            .exterior()
            .lines()
            .filter_map(|edge| {
                match Line::new(project(edge.start), project(edge.end)).closest_point(&target) {
                    Closest::Intersection(q) | Closest::SinglePoint(q) => {
                        Some(Point::new(q.x() / k, q.y()))
                    }
                    Closest::Indeterminate => None,
                }
            })
            .map(|q| haversine_km(p, q))
            .fold(f64::INFINITY, f64::min)
    }
}

fn validate_threshold(threshold_km: f64) -> Result<(), ProximityError> {
    if !threshold_km.is_finite() || threshold_km < 0.0 {
        return Err(ProximityError::InvalidThreshold(threshold_km));
    }
    Ok(())
}

/// Validate vertices and drop the closing vertex and consecutive duplicates.
fn normalize_ring(boundary: &LineString<f64>) -> Result<Vec<Coord<f64>>, ProximityError> {
    let mut ring: Vec<Coord<f64>> = Vec::with_capacity(boundary.0.len());
    for &c in boundary.coords() {
        if !is_valid_lat_lon(c.y, c.x) {
            return Err(ProximityError::InvalidVertex { lon: c.x, lat: c.y });
        }
        if ring.last() != Some(&c) {
            ring.push(c);
        }
    }
    while ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err(ProximityError::TooFewVertices(ring.len()));
    }
    Ok(ring)
}

/// Shift each longitude by ±360° so consecutive vertices never jump more
/// than 180°. Fails for rings whose total longitude winding is a full turn.
fn unwrap_ring(ring: Vec<Coord<f64>>) -> Result<Vec<Coord<f64>>, ProximityError> {
    fn step(from: f64, to: f64) -> f64 {
        let mut adjusted = to;
        while adjusted - from > 180.0 {
            adjusted -= 360.0;
        }
        while adjusted - from < -180.0 {
            adjusted += 360.0;
        }
        adjusted
    }

    let mut out: Vec<Coord<f64>> = Vec::with_capacity(ring.len());
    for c in ring {
        let x = match out.last() {
            Some(prev) => step(prev.x, c.x),
            None => c.x,
        };
        out.push(Coord { x, y: c.y });
    }

    let first = out[0].x;
    let last = out[out.len() - 1].x;
    let winding = (last - first) + (step(last, first) - last);
    if winding.abs() > 180.0 {
        return Err(ProximityError::EnclosesPole);
    }
    Ok(out)
}

/// Ids of trajectories with any point inside any hazard's buffer.
///
/// Hazards with malformed geometry are skipped and logged.
pub fn classify(
    trajectories: &[Trajectory],
    hazards: &[HazardArea],
    threshold_km: f64,
) -> BTreeSet<String> {
    if let Err(e) = validate_threshold(threshold_km) {
        tracing::warn!("Proximity: {}, classifying nothing", e);
        return BTreeSet::new();
    }

    let buffered: Vec<BufferedHazard> = hazards
        .iter()
        .filter_map(|h| match BufferedHazard::prepare(h, threshold_km) {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::warn!("Proximity: skipping hazard {}: {}", h.id, e);
                None
            }
        })
        .collect();

    let monitoring: BTreeSet<String> = trajectories
        .iter()
        .filter(|t| {
            buffered.iter().any(|h| {
                t.points()
                    .iter()
                    .any(|p| h.contains(p.latitude, p.longitude))
            })
        })
        .map(|t| t.id.clone())
        .collect();

    tracing::debug!(
        "Proximity: {} of {} trajectories within {} km of {} hazards",
        monitoring.len(),
        trajectories.len(),
        threshold_km,
        buffered.len()
    );

    monitoring
}

/// Classifier bound to a configured threshold.
#[derive(Debug, Clone, Copy)]
pub struct ProximityClassifier {
    threshold_km: f64,
}

impl ProximityClassifier {
    pub fn new(threshold_km: f64) -> Result<Self, ProximityError> {
        validate_threshold(threshold_km)?;
        Ok(Self { threshold_km })
    }

    pub fn threshold_km(&self) -> f64 {
        self.threshold_km
    }

    pub fn classify(
        &self,
        trajectories: &[Trajectory],
        hazards: &[HazardArea],
    ) -> BTreeSet<String> {
        classify(trajectories, hazards, self.threshold_km)
    }
}

impl Default for ProximityClassifier {
    fn default() -> Self {
        Self {
            threshold_km: DEFAULT_THRESHOLD_KM,
        }
    }
}
