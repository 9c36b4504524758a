//! Geodesic helpers
//!
//! Small pure functions shared by candidate deduplication and the
//! evidence checkers.

/// Mean Earth radius in meters (IUGG)
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Returns true if `lat` is a valid latitude in degrees.
pub fn is_valid_lat(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

/// Returns true if `lon` is a valid longitude in degrees.
pub fn is_valid_lon(lon: f64) -> bool {
    lon.is_finite() && (-180.0..=180.0).contains(&lon)
}

/// Great-circle distance between two WGS84 points, in meters.
///
/// Haversine formulation; accurate to well under the 1 km dedup
/// threshold for any pair of points on Earth.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}
