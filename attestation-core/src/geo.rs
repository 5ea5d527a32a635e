//! Geodesic distance and geofence checks.

/// Mean earth radius in meters, as used by the shipment geofence.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default geofence radius in meters. Callers may override per session.
pub const DEFAULT_RADIUS_M: u64 = 2_000;

/// Haversine great-circle distance between two points in decimal degrees.
pub fn geodesic_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let rad_lat1 = lat1.to_radians();
    let rad_lat2 = lat2.to_radians();
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + rad_lat1.cos() * rad_lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

/// Distance rounded to whole meters, half-to-even.
pub fn distance_meters_rounded(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> u64 {
    geodesic_distance_m(lat1, lon1, lat2, lon2).round_ties_even() as u64
}

/// A point is within the geofence iff the distance does not exceed the
/// radius; exact equality passes.
pub fn within_radius(distance_m: u64, radius_m: u64) -> bool {
    distance_m <= radius_m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(distance_meters_rounded(37.7749, -122.4194, 37.7749, -122.4194), 0);
    }

    #[test]
    fn test_short_hop_in_san_francisco() {
        // ~14 m between two adjacent readings.
        let d = geodesic_distance_m(37.7749, -122.4194, 37.7750, -122.4193);
        assert!((13.0..16.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_equatorial_hundredth_degree() {
        // 0.01 degrees of longitude at the equator, mean-radius sphere.
        assert_eq!(distance_meters_rounded(0.0, 0.0, 0.0, 0.01), 1_112);
    }

    #[test]
    fn test_cross_town_distance_exceeds_default_radius() {
        let d = distance_meters_rounded(37.7749, -122.4194, 37.80, -122.42);
        assert!(d > DEFAULT_RADIUS_M, "distance was {d}");
        assert!((2_700..4_200).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_radius_boundary() {
        assert!(within_radius(2_000, 2_000));
        assert!(!within_radius(2_001, 2_000));
    }
}
