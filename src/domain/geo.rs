//! Geospatial helpers shared by the geo entity kind and the in-memory
//! test adapter, so the backfill materialisation and the memory tier
//! agree on distances.

use crate::error::{Error, Result};

/// Mean earth radius used by the memory tier's geo commands, in meters.
const EARTH_RADIUS_METERS: f64 = 6_372_797.560856;

/// Distance unit for radius queries and returned distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceUnit {
    #[default]
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl DistanceUnit {
    /// Wire token understood by the memory tier (`m`, `km`, `mi`, `ft`).
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceUnit::Meters => "m",
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
            DistanceUnit::Feet => "ft",
        }
    }

    /// Parse a wire token; anything else is an invalid query.
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "m" => Ok(DistanceUnit::Meters),
            "km" => Ok(DistanceUnit::Kilometers),
            "mi" => Ok(DistanceUnit::Miles),
            "ft" => Ok(DistanceUnit::Feet),
            other => Err(Error::InvalidQuery(format!(
                "unknown distance unit '{other}'"
            ))),
        }
    }

    /// Convert a value in this unit to meters.
    pub fn to_meters(&self, value: f64) -> f64 {
        match self {
            DistanceUnit::Meters => value,
            DistanceUnit::Kilometers => value * 1_000.0,
            DistanceUnit::Miles => value * 1_609.344,
            DistanceUnit::Feet => value * 0.3048,
        }
    }

    /// Convert a value in meters to this unit.
    pub fn from_meters(&self, meters: f64) -> f64 {
        match self {
            DistanceUnit::Meters => meters,
            DistanceUnit::Kilometers => meters / 1_000.0,
            DistanceUnit::Miles => meters / 1_609.344,
            DistanceUnit::Feet => meters / 0.3048,
        }
    }
}

impl std::fmt::Display for DistanceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Great-circle distance between two (latitude, longitude) points in meters.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1r.cos() * lat2r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_METERS * c
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_round_trip() {
        for unit in [
            DistanceUnit::Meters,
            DistanceUnit::Kilometers,
            DistanceUnit::Miles,
            DistanceUnit::Feet,
        ] {
            assert_eq!(DistanceUnit::parse(unit.as_str()).unwrap(), unit);
            let meters = unit.to_meters(3.5);
            assert!((unit.from_meters(meters) - 3.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_unknown_unit_rejected() {
        assert!(DistanceUnit::parse("yd").is_err());
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_meters(48.85, 2.35, 48.85, 2.35), 0.0);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Paris -> London is roughly 344 km.
        let d = haversine_meters(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344_000.0).abs() < 5_000.0, "got {d}");
    }

    #[test]
    fn test_haversine_symmetry() {
        let a = haversine_meters(10.0, 20.0, -30.0, 40.0);
        let b = haversine_meters(-30.0, 40.0, 10.0, 20.0);
        assert!((a - b).abs() < 1e-6);
    }
}
