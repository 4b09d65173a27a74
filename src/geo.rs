//! Great-circle distance and location obfuscation

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Slack added to distance comparisons to absorb floating point error.
pub const DISTANCE_MARGIN_M: f64 = 0.5;
/// Maximum displacement applied when a location is obfuscated for publication.
pub const OBFUSCATION_RADIUS_M: f64 = 500.0;

const MICRODEGREE: f64 = 1_000_000.0;

// Coordinates are kept as microdegree integers so documents stay exact under
// encode/decode round trips.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatLng {
    #[n(0)]
    pub latitude: i64,
    #[n(1)]
    pub longitude: i64,
}

impl LatLng {
    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: (latitude * MICRODEGREE).round() as i64,
            longitude: (longitude * MICRODEGREE).round() as i64,
        }
    }

    pub fn latitude_degrees(&self) -> f64 {
        self.latitude as f64 / MICRODEGREE
    }

    pub fn longitude_degrees(&self) -> f64 {
        self.longitude as f64 / MICRODEGREE
    }
}

/// Great-circle distance between two points in meters (Haversine).
pub fn haversine_distance_m(a: &LatLng, b: &LatLng) -> f64 {
    let lat_a = a.latitude_degrees().to_radians();
    let lat_b = b.latitude_degrees().to_radians();
    let half_dlat = ((lat_b - lat_a) / 2.0).sin();
    let half_dlng = ((b.longitude_degrees() - a.longitude_degrees()).to_radians() / 2.0).sin();

    let h = half_dlat * half_dlat + lat_a.cos() * lat_b.cos() * half_dlng * half_dlng;
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Distance comparison with the shared floating point margin applied.
pub fn within_distance_m(a: &LatLng, b: &LatLng, meters: f64) -> bool {
    haversine_distance_m(a, b) <= meters + DISTANCE_MARGIN_M
}

/// Displace a point deterministically within [`OBFUSCATION_RADIUS_M`].
///
/// The bearing and distance of the displacement are derived from a digest of
/// the salt and the point itself, so the same salt always publishes the same
/// obfuscated location. The salt is supplied by the caller's configuration.
pub fn obfuscate_location(point: &LatLng, salt: &str) -> LatLng {
    let digest = sha256::digest(format!("{salt}:{}:{}", point.latitude, point.longitude));
    let raw = hex::decode(digest).unwrap_or_default();
    if raw.len() < 8 {
        return *point;
    }

    let bearing_word = u32::from_be_bytes(raw[0..4].try_into().unwrap_or_default());
    let distance_word = u32::from_be_bytes(raw[4..8].try_into().unwrap_or_default());

    let bearing = bearing_word as f64 / u32::MAX as f64 * std::f64::consts::TAU;
    let distance = distance_word as f64 / u32::MAX as f64 * OBFUSCATION_RADIUS_M;

    let dlat_deg = (distance * bearing.cos() / EARTH_RADIUS_M).to_degrees();
    // longitude circles shrink with latitude; clamp the cosine away from the poles
    let lat_cos = point.latitude_degrees().to_radians().cos().max(0.01);
    let dlng_deg = (distance * bearing.sin() / (EARTH_RADIUS_M * lat_cos)).to_degrees();

    LatLng {
        latitude: point.latitude + (dlat_deg * MICRODEGREE).round() as i64,
        longitude: point.longitude + (dlng_deg * MICRODEGREE).round() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_same_point() {
        let p = LatLng::from_degrees(41.3874, 2.1686);
        assert!(haversine_distance_m(&p, &p) < DISTANCE_MARGIN_M);
    }

    #[test]
    fn one_degree_of_latitude() {
        let a = LatLng::from_degrees(41.0, 2.0);
        let b = LatLng::from_degrees(42.0, 2.0);

        // one degree of latitude is pi/180 * earth radius
        let expected = std::f64::consts::PI / 180.0 * EARTH_RADIUS_M;
        assert!((haversine_distance_m(&a, &b) - expected).abs() < 1.0);
    }

    #[test]
    fn obfuscation_is_deterministic_and_bounded() {
        let p = LatLng::from_degrees(41.3874, 2.1686);

        let first = obfuscate_location(&p, "salt-a");
        let second = obfuscate_location(&p, "salt-a");
        assert_eq!(first, second);

        assert!(within_distance_m(&p, &first, OBFUSCATION_RADIUS_M));
    }

    #[test]
    fn obfuscation_varies_with_salt() {
        let p = LatLng::from_degrees(41.3874, 2.1686);

        let a = obfuscate_location(&p, "salt-a");
        let b = obfuscate_location(&p, "salt-b");
        assert_ne!(a, b);
    }
}
