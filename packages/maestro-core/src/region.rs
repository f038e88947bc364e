//! Discord voice region geography for region-aware node selection.
//!
//! Maps region names to approximate coordinates and provides the
//! great-circle distance used by the penalty scoring in [`crate::node`].

/// Static region -> (latitude, longitude) table.
///
/// Entries cover the Discord voice regions plus the generic continental
/// names nodes commonly advertise. Deprecated `vip-` regions resolve via
/// prefix stripping in [`region_coordinates`].
pub const REGION_POSITIONS: &[(&str, f64, f64)] = &[
    ("amsterdam", 52.37, 4.89),
    ("brazil", -23.55, -46.63),
    ("dubai", 25.20, 55.27),
    ("eu-central", 50.11, 8.68),
    ("eu-west", 48.86, 2.35),
    ("europe", 50.11, 8.68),
    ("frankfurt", 50.11, 8.68),
    ("hongkong", 22.32, 114.17),
    ("india", 19.08, 72.88),
    ("japan", 35.68, 139.69),
    ("london", 51.51, -0.13),
    ("milan", 45.46, 9.19),
    ("rotterdam", 51.92, 4.48),
    ("russia", 55.76, 37.62),
    ("singapore", 1.35, 103.82),
    ("southafrica", -26.20, 28.05),
    ("south-korea", 37.57, 126.98),
    ("sydney", -33.87, 151.21),
    ("us-central", 41.88, -87.63),
    ("us-east", 40.71, -74.01),
    ("us-south", 29.76, -95.37),
    ("us-west", 37.77, -122.42),
];

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Resolves a region name to approximate coordinates.
///
/// Matching is case-insensitive, strips the deprecated `vip-` prefix, and
/// falls back to a prefix match so endpoint-style names such as
/// `us-east1234` still resolve.
#[must_use]
pub fn region_coordinates(region: &str) -> Option<(f64, f64)> {
    let normalized = region.to_ascii_lowercase();
    let normalized = normalized.strip_prefix("vip-").unwrap_or(&normalized);

    REGION_POSITIONS
        .iter()
        .find(|(name, _, _)| *name == normalized)
        .or_else(|| {
            REGION_POSITIONS
                .iter()
                .find(|(name, _, _)| normalized.starts_with(name))
        })
        .map(|(_, lat, lon)| (*lat, *lon))
}

/// Great-circle distance between two (latitude, longitude) points in km.
///
/// Haversine formula; accurate enough for ranking nodes by proximity.
#[must_use]
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Distance between two named regions in km, when both resolve.
#[must_use]
pub fn region_distance_km(a: &str, b: &str) -> Option<f64> {
    Some(haversine_km(region_coordinates(a)?, region_coordinates(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_region_resolves() {
        assert!(region_coordinates("us-east").is_some());
        assert!(region_coordinates("Sydney").is_some());
    }

    #[test]
    fn vip_prefix_is_stripped() {
        assert_eq!(
            region_coordinates("vip-us-east"),
            region_coordinates("us-east")
        );
    }

    #[test]
    fn endpoint_style_name_prefix_matches() {
        assert_eq!(
            region_coordinates("us-west1234"),
            region_coordinates("us-west")
        );
    }

    #[test]
    fn unknown_region_is_none() {
        assert!(region_coordinates("atlantis").is_none());
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        let p = (52.37, 4.89);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Amsterdam <-> Sydney is roughly 16,650 km.
        let d = region_distance_km("amsterdam", "sydney").unwrap();
        assert!((15_500.0..17_500.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn nearby_regions_are_closer_than_far_ones() {
        let close = region_distance_km("rotterdam", "amsterdam").unwrap();
        let far = region_distance_km("rotterdam", "japan").unwrap();
        assert!(close < far);
    }
}
