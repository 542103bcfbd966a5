//! Shared geodesy helpers.
//!
//! Distances come from `geo`'s haversine implementation on its mean Earth
//! radius. Everything here takes and returns kilometres and degrees.

use geo::{HaversineDistance, Point};

/// Mean Earth radius in kilometres, the one `geo` measures with.
// geo 0.28 keeps `MEAN_EARTH_RADIUS` private; this is its value (metres).
pub(crate) const EARTH_RADIUS_KM: f64 = 6_371_008.8 / 1000.0;

/// Great-circle distance in kilometres. Points are (x = lon, y = lat).
pub(crate) fn haversine_km(a: Point<f64>, b: Point<f64>) -> f64 {
    a.haversine_distance(&b) / 1000.0
}

/// Central angle in degrees subtended by `km` along a great circle.
pub(crate) fn km_to_degrees(km: f64) -> f64 {
    (km / EARTH_RADIUS_KM).to_degrees()
}

/// True if latitude and longitude are finite and within WGS84 bounds.
pub(crate) fn is_valid_lat_lon(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}
