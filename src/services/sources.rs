//! Upstream feed adapters.
//!
//! Each adapter call fetches one source and maps its payload into canonical
//! `Trajectory` / `HazardArea` values. Format differences between upstreams
//! are absorbed here and nowhere else: a payload that cannot be mapped fails
//! as a typed `FetchError` at this boundary instead of leaking into the merge.
//!
//! Supported parse strategies:
//! - Windborne constellation frames (`https://a.windbornesystems.com/treasure/NN.json`)
//! - trajectory feeds in this service's own wire shape
//! - GeoJSON alert collections (NWS `alerts/active`)

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use geo::{Coord, LineString, Polygon};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::models::{HazardArea, Severity, Trajectory, TrajectoryPoint};
use crate::services::clock::SharedClock;

/// Why a single source failed this round.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchFailure {
    #[error("request timed out")]
    Timeout,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("source returned records for the wrong dataset")]
    WrongDataset,
    #[error("overall fetch deadline exceeded")]
    DeadlineExceeded,
}

/// A failed adapter call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("source '{source_id}' failed: {reason}")]
pub struct FetchError {
    pub source_id: String,
    pub reason: FetchFailure,
}

impl FetchError {
    pub fn new(source_id: impl Into<String>, reason: FetchFailure) -> Self {
        Self {
            source_id: source_id.into(),
            reason,
        }
    }
}

/// How a source's payload is parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// JSON array of `[lat, lon, alt]`; the array index is the balloon id and
    /// every point is stamped `now - hours_ago`.
    WindborneFrame { hours_ago: u32 },
    /// JSON object of id → `{trajectory|points: [{lat, lon, alt, timestamp}]}`.
    TrajectoryFeed,
    /// GeoJSON FeatureCollection of alerts with polygon geometry.
    GeoJsonAlerts,
}

/// Descriptor of one upstream source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    /// Unique within a dataset's source list.
    pub id: String,
    pub url: String,
    /// Logical upstream this source belongs to. Sources sharing a feed are
    /// partial views of the same objects and get stitched on merge.
    pub feed: String,
    pub kind: SourceKind,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>, kind: SourceKind) -> Self {
        let id = id.into();
        Self {
            feed: id.clone(),
            id,
            url: url.into(),
            kind,
        }
    }

    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = feed.into();
        self
    }

    /// One hourly Windborne frame, e.g. `03.json` for three hours ago.
    pub fn windborne_frame(base_url: &str, hours_ago: u32) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::new(
            format!("windborne-{:02}", hours_ago),
            format!("{}/{:02}.json", base, hours_ago),
            SourceKind::WindborneFrame { hours_ago },
        )
        .with_feed("windborne")
    }

    /// The frame sources for the last `hours` hours (00.json .. hours-1).
    pub fn windborne_history(base_url: &str, hours: u32) -> Vec<Self> {
        (0..hours)
            .map(|h| Self::windborne_frame(base_url, h))
            .collect()
    }
}

/// Typed intermediate between an adapter and the merge step.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecords {
    Trajectories(Vec<Trajectory>),
    Hazards(Vec<HazardArea>),
}

impl RawRecords {
    pub fn len(&self) -> usize {
        match self {
            RawRecords::Trajectories(t) => t.len(),
            RawRecords::Hazards(h) => h.len(),
        }
    }
}

/// Fetches and normalises one source. Implementations must not touch shared
/// state and must not retry.
pub trait SourceAdapter: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        source: &'a SourceConfig,
    ) -> BoxFuture<'a, Result<RawRecords, FetchError>>;
}

/// reqwest-backed adapter with a per-call timeout.
#[derive(Clone)]
pub struct HttpSourceAdapter {
    client: reqwest::Client,
    user_agent: String,
    timeout: std::time::Duration,
    clock: SharedClock,
}

impl HttpSourceAdapter {
    pub fn new(
        user_agent: &str,
        timeout: std::time::Duration,
        clock: SharedClock,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().pool_max_idle_per_host(4).build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            timeout,
            clock,
        })
    }

    /// GET the source URL and decode the body as JSON.
    async fn fetch_json(&self, source: &SourceConfig) -> Result<serde_json::Value, FetchFailure> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| FetchFailure::Transport(format!("invalid User-Agent: {}", e)))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/geo+json, application/json"),
        );

        let response = self
            .client
            .get(&source.url)
            .headers(headers)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(FetchFailure::Status(response.status().as_u16()));
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchFailure::Malformed(format!("invalid JSON: {}", e)))
    }
}

impl SourceAdapter for HttpSourceAdapter {
    fn fetch<'a>(
        &'a self,
        source: &'a SourceConfig,
    ) -> BoxFuture<'a, Result<RawRecords, FetchError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let json = self
                .fetch_json(source)
                .await
                .map_err(|reason| FetchError::new(&source.id, reason))?;
            let records = parse_records(source, &json, now)
                .map_err(|reason| FetchError::new(&source.id, reason))?;
            tracing::debug!(
                "Source {}: parsed {} records from {}",
                source.id,
                records.len(),
                source.url
            );
            Ok(records)
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchFailure {
    if e.is_timeout() {
        FetchFailure::Timeout
    } else {
        FetchFailure::Transport(e.to_string())
    }
}

/// Map a decoded payload into records according to the source's kind.
pub fn parse_records(
    source: &SourceConfig,
    json: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<RawRecords, FetchFailure> {
    match source.kind {
        SourceKind::WindborneFrame { hours_ago } => {
            let observed_at = now - Duration::hours(i64::from(hours_ago));
            parse_windborne_frame(&source.id, json, observed_at).map(RawRecords::Trajectories)
        }
        SourceKind::TrajectoryFeed => {
            parse_trajectory_feed(&source.id, json).map(RawRecords::Trajectories)
        }
        SourceKind::GeoJsonAlerts => {
            parse_geojson_alerts(&source.id, json).map(RawRecords::Hazards)
        }
    }
}

// --- Windborne frames ---

/// Parse a single `[lat, lon, alt]` item.
fn parse_triple(item: &serde_json::Value) -> Option<(f64, f64, f64)> {
    match item.as_array()?.as_slice() {
        [lat, lon, alt] => Some((lat.as_f64()?, lon.as_f64()?, alt.as_f64()?)),
        _ => None,
    }
}

/// Parse one constellation frame. Invalid items are skipped; the remaining
/// balloons keep their array index as id.
pub fn parse_windborne_frame(
    source_id: &str,
    json: &serde_json::Value,
    observed_at: DateTime<Utc>,
) -> Result<Vec<Trajectory>, FetchFailure> {
    let items = json.as_array().ok_or_else(|| {
        FetchFailure::Malformed(format!("expected array, got {}", json_type_name(json)))
    })?;

    let mut trajectories = Vec::with_capacity(items.len());
    let mut skipped = 0usize;

    for (idx, item) in items.iter().enumerate() {
        let point = parse_triple(item)
            .and_then(|(lat, lon, alt)| TrajectoryPoint::new(lat, lon, alt, observed_at));
        match point.and_then(|p| Trajectory::new(idx.to_string(), vec![p])) {
            Some(t) => trajectories.push(t),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!(
            "Source {}: skipped {} invalid data points out of {}",
            source_id,
            skipped,
            items.len()
        );
    }

    Ok(trajectories)
}

// --- Trajectory feeds ---

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(alias = "points")]
    trajectory: Vec<FeedPoint>,
}

#[derive(Debug, Deserialize)]
struct FeedPoint {
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude")]
    lon: f64,
    #[serde(alias = "altitude", default)]
    alt: f64,
    #[serde(alias = "observedAt", alias = "observed_at")]
    timestamp: DateTime<Utc>,
}

/// Parse a feed of complete trajectories keyed by id.
pub fn parse_trajectory_feed(
    source_id: &str,
    json: &serde_json::Value,
) -> Result<Vec<Trajectory>, FetchFailure> {
    let feed = BTreeMap::<String, FeedEntry>::deserialize(json)
        .map_err(|e| FetchFailure::Malformed(format!("trajectory feed structure: {}", e)))?;

    let mut trajectories = Vec::with_capacity(feed.len());
    let mut skipped_points = 0usize;

    for (id, entry) in feed {
        let total = entry.trajectory.len();
        let points: Vec<TrajectoryPoint> = entry
            .trajectory
            .into_iter()
            .filter_map(|p| TrajectoryPoint::new(p.lat, p.lon, p.alt, p.timestamp))
            .collect();
        skipped_points += total - points.len();
        if let Some(t) = Trajectory::new(id, points) {
            trajectories.push(t);
        }
    }

    if skipped_points > 0 {
        tracing::warn!(
            "Source {}: skipped {} invalid trajectory points",
            source_id,
            skipped_points
        );
    }

    Ok(trajectories)
}

// --- GeoJSON alerts ---

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    id: Option<serde_json::Value>,
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: AlertProperties,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Vec<f64>>>>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertProperties {
    id: Option<String>,
    severity: Option<String>,
    event: Option<String>,
    headline: Option<String>,
    area_desc: Option<String>,
    onset: Option<String>,
    expires: Option<String>,
    sender_name: Option<String>,
}

impl AlertProperties {
    fn metadata(&self) -> BTreeMap<String, String> {
        let fields = [
            ("event", &self.event),
            ("headline", &self.headline),
            ("areaDesc", &self.area_desc),
            ("onset", &self.onset),
            ("expires", &self.expires),
            ("senderName", &self.sender_name),
        ];
        fields
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

/// Convert a GeoJSON linear ring into a polygon without holes. `None` if
/// any position has fewer than two coordinates.
fn ring_polygon(ring: &[Vec<f64>]) -> Option<Polygon<f64>> {
    let coords = ring
        .iter()
        .map(|pos| match pos.as_slice() {
            [lon, lat, ..] => Some(Coord { x: *lon, y: *lat }),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(LineString::new(coords), vec![]))
}

/// Parse an alert FeatureCollection. Only polygonal geometry is kept; each
/// part of a MultiPolygon becomes its own hazard with id `{id}#{n}`.
pub fn parse_geojson_alerts(
    source_id: &str,
    json: &serde_json::Value,
) -> Result<Vec<HazardArea>, FetchFailure> {
    let collection = FeatureCollection::deserialize(json)
        .map_err(|e| FetchFailure::Malformed(format!("GeoJSON structure: {}", e)))?;

    let mut hazards = Vec::new();
    let mut without_polygon = 0usize;
    let mut bad_positions = 0usize;

    for (idx, feature) in collection.features.into_iter().enumerate() {
        let id = feature_id(&feature, source_id, idx);
        let severity = feature
            .properties
            .severity
            .as_deref()
            .map(Severity::parse)
            .unwrap_or(Severity::Unknown);

        let outer_rings: Vec<Vec<Vec<f64>>> = match feature.geometry {
            Some(Geometry::Polygon { coordinates }) => {
                coordinates.into_iter().take(1).collect()
            }
            Some(Geometry::MultiPolygon { coordinates }) => coordinates
                .into_iter()
                .filter_map(|poly| poly.into_iter().next())
                .collect(),
            Some(Geometry::Other) | None => {
                without_polygon += 1;
                continue;
            }
        };

        let multi = outer_rings.len() > 1;
        for (part, ring) in outer_rings.iter().enumerate() {
            let Some(boundary) = ring_polygon(ring) else {
                bad_positions += 1;
                continue;
            };
            hazards.push(HazardArea {
                id: if multi {
                    format!("{}#{}", id, part)
                } else {
                    id.clone()
                },
                boundary,
                severity,
                metadata: feature.properties.metadata(),
            });
        }
    }

    if without_polygon > 0 {
        tracing::debug!(
            "Source {}: {} alerts without polygon geometry ignored",
            source_id,
            without_polygon
        );
    }
    if bad_positions > 0 {
        tracing::warn!(
            "Source {}: skipped {} rings with invalid positions",
            source_id,
            bad_positions
        );
    }

    Ok(hazards)
}

fn feature_id(feature: &Feature, source_id: &str, idx: usize) -> String {
    match (&feature.id, &feature.properties.id) {
        (Some(serde_json::Value::String(s)), _) => s.clone(),
        (Some(serde_json::Value::Number(n)), _) => n.to_string(),
        (_, Some(s)) => s.clone(),
        _ => format!("{}-{}", source_id, idx),
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use std::sync::Arc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn now() -> DateTime<Utc> {
        "2026-09-01T12:00:00Z".parse().unwrap()
    }

    fn adapter(timeout_ms: u64) -> HttpSourceAdapter {
        HttpSourceAdapter::new(
            "HurricaneHunter/test",
            std::time::Duration::from_millis(timeout_ms),
            ManualClock::new(now()),
        )
        .unwrap()
    }

    #[test]
    fn test_windborne_frame_ids_are_array_indices() {
        let json = serde_json::json!([
            [29.0, -90.0, 15.2],
            "garbage",
            [10.0, 100.0, 3.1]
        ]);
        let ts = now() - Duration::hours(3);
        let result = parse_windborne_frame("windborne-03", &json, ts).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "0");
        assert_eq!(result[1].id, "2", "Skipped items must not shift later ids");
        assert_eq!(result[1].latest().observed_at, ts);
        assert_eq!(result[1].latest().longitude, 100.0);
    }

    #[test]
    fn test_windborne_frame_skips_out_of_range_and_short_items() {
        let json = serde_json::json!([[95.0, 0.0, 1.0], [1.0, 2.0], [1.0, 2.0, 3.0, 4.0]]);
        let result = parse_windborne_frame("windborne-00", &json, now()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_windborne_frame_rejects_non_array() {
        let json = serde_json::json!({"balloons": []});
        let err = parse_windborne_frame("windborne-00", &json, now()).unwrap_err();
        assert!(matches!(err, FetchFailure::Malformed(ref m) if m.contains("object")));
    }

    #[test]
    fn test_parse_records_stamps_hours_ago() {
        let source = SourceConfig::windborne_frame("https://example.test/treasure/", 5);
        let json = serde_json::json!([[1.0, 2.0, 3.0]]);
        let records = parse_records(&source, &json, now()).unwrap();
        let RawRecords::Trajectories(t) = records else {
            panic!("expected trajectories");
        };
        assert_eq!(t[0].latest().observed_at, now() - Duration::hours(5));
    }

    #[test]
    fn test_windborne_source_urls() {
        let sources =
            SourceConfig::windborne_history("https://a.windbornesystems.com/treasure/", 24);
        assert_eq!(sources.len(), 24);
        assert_eq!(sources[0].url, "https://a.windbornesystems.com/treasure/00.json");
        assert_eq!(sources[23].url, "https://a.windbornesystems.com/treasure/23.json");
        assert_eq!(sources[7].id, "windborne-07");
        assert!(sources.iter().all(|s| s.feed == "windborne"));
    }

    #[test]
    fn test_trajectory_feed_accepts_both_shapes() {
        let json = serde_json::json!({
            "B1": {
                "id": "B1",
                "trajectory": [
                    {"lat": 29.0, "lon": -90.0, "alt": 15.0, "timestamp": "2026-09-01T11:00:00Z"},
                    {"lat": 28.0, "lon": -91.0, "alt": 14.0, "timestamp": "2026-09-01T10:00:00Z"}
                ]
            },
            "B2": {
                "points": [
                    {
                        "latitude": 1.0, "longitude": 2.0, "altitude": 3.0,
                        "observedAt": "2026-09-01T09:00:00Z"
                    }
                ],
                "isMonitoring": false
            }
        });
        let result = parse_trajectory_feed("feed", &json).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "B1");
        assert_eq!(result[0].points()[0].latitude, 28.0, "Points sorted chronologically");
        assert_eq!(result[1].id, "B2");
    }

    #[test]
    fn test_trajectory_feed_drops_entries_without_valid_points() {
        let json = serde_json::json!({
            "B1": {"trajectory": [
                {"lat": 120.0, "lon": 0.0, "alt": 1.0, "timestamp": "2026-09-01T11:00:00Z"}
            ]}
        });
        assert!(parse_trajectory_feed("feed", &json).unwrap().is_empty());
    }

    #[test]
    fn test_trajectory_feed_rejects_wrong_structure() {
        let json = serde_json::json!([1, 2, 3]);
        assert!(matches!(
            parse_trajectory_feed("feed", &json),
            Err(FetchFailure::Malformed(_))
        ));
    }

    fn alerts_json() -> serde_json::Value {
        serde_json::json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "id": "https://api.weather.gov/alerts/urn:oid:1",
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[
                            [-91.0, 28.0], [-89.0, 28.0], [-89.0, 30.0],
                            [-91.0, 30.0], [-91.0, 28.0]
                        ]]
                    },
                    "properties": {
                        "severity": "Severe",
                        "event": "Hurricane Warning",
                        "headline": "Hurricane Warning issued",
                        "areaDesc": "Coastal Louisiana"
                    }
                },
                {
                    "id": "https://api.weather.gov/alerts/urn:oid:2",
                    "type": "Feature",
                    "geometry": null,
                    "properties": {"severity": "Minor"}
                },
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [
                            [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]],
                            [[[5.0, 5.0], [6.0, 5.0], [6.0, 6.0]]]
                        ]
                    },
                    "properties": {"id": "multi", "severity": "extreme"}
                },
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
                    "properties": {}
                }
            ]
        })
    }

    #[test]
    fn test_geojson_alerts_polygon_and_multipolygon() {
        let hazards = parse_geojson_alerts("nws", &alerts_json()).unwrap();
        assert_eq!(hazards.len(), 3);

        assert_eq!(hazards[0].id, "https://api.weather.gov/alerts/urn:oid:1");
        assert_eq!(hazards[0].severity, Severity::Severe);
        let ring = hazards[0].boundary.exterior();
        assert_eq!(ring.0.len(), 5);
        assert_eq!(ring.0[0], Coord { x: -91.0, y: 28.0 });
        assert!(hazards[0].boundary.interiors().is_empty());
        assert_eq!(
            hazards[0].metadata.get("event").map(String::as_str),
            Some("Hurricane Warning")
        );

        assert_eq!(hazards[1].id, "multi#0");
        assert_eq!(hazards[2].id, "multi#1");
        assert_eq!(hazards[2].severity, Severity::Extreme);
    }

    #[test]
    fn test_geojson_alerts_fallback_id_and_severity() {
        let json = serde_json::json!({
            "features": [{
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]]
                },
                "properties": {}
            }]
        });
        let hazards = parse_geojson_alerts("nws", &json).unwrap();
        assert_eq!(hazards[0].id, "nws-0");
        assert_eq!(hazards[0].severity, Severity::Unknown);
    }

    #[test]
    fn test_geojson_alerts_skips_bad_positions() {
        let json = serde_json::json!({
            "features": [{
                "id": "a",
                "geometry": {"type": "Polygon", "coordinates": [[[0.0], [1.0, 0.0], [1.0, 1.0]]]},
                "properties": {}
            }]
        });
        assert!(parse_geojson_alerts("nws", &json).unwrap().is_empty());
    }

    #[test]
    fn test_geojson_alerts_rejects_non_collection() {
        let json = serde_json::json!("not geojson");
        assert!(matches!(
            parse_geojson_alerts("nws", &json),
            Err(FetchFailure::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_http_adapter_fetches_windborne_frame() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/treasure/02.json"))
            .and(header_exists("user-agent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([[29.0, -90.0, 15.0], [10.0, 100.0, 2.0]])),
            )
            .mount(&server)
            .await;

        let source = SourceConfig::windborne_frame(&format!("{}/treasure/", server.uri()), 2);
        let records = tokio_test::assert_ok!(adapter(2000).fetch(&source).await);
        let RawRecords::Trajectories(t) = records else {
            panic!("expected trajectories");
        };
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].latest().observed_at, now() - Duration::hours(2));
    }

    #[tokio::test]
    async fn test_http_adapter_maps_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = SourceConfig::new("nws", server.uri(), SourceKind::GeoJsonAlerts);
        let err = tokio_test::assert_err!(adapter(2000).fetch(&source).await);
        assert_eq!(err.source_id, "nws");
        assert_eq!(err.reason, FetchFailure::Status(503));
    }

    #[tokio::test]
    async fn test_http_adapter_maps_invalid_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[[1.0, NaN, 2.0]]"))
            .mount(&server)
            .await;

        let source = SourceConfig::windborne_frame(&server.uri(), 0);
        let err = adapter(2000).fetch(&source).await.unwrap_err();
        assert!(matches!(err.reason, FetchFailure::Malformed(_)));
    }

    #[tokio::test]
    async fn test_http_adapter_applies_per_call_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([]))
                    .set_delay(std::time::Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let source = SourceConfig::windborne_frame(&server.uri(), 0);
        let err = adapter(100).fetch(&source).await.unwrap_err();
        assert_eq!(err.reason, FetchFailure::Timeout);
    }

    #[tokio::test]
    async fn test_http_adapter_is_shareable_across_tasks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let adapter = Arc::new(adapter(2000));
        let source = SourceConfig::new("feed", server.uri(), SourceKind::TrajectoryFeed);
        let handle = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.fetch(&source).await }
        });
        let records = handle.await.unwrap().unwrap();
        assert_eq!(records, RawRecords::Trajectories(Vec::new()));
    }
}
