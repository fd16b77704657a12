//! Shared fixtures for the integration tests: a small street grid around (10.0, 120.0) and
//! helpers to build fixes on it.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use nalgebra::Vector2;
use roadtrack::earth::LocalProjection;
use roadtrack::road::{EdgeId, RoadEdge};
use roadtrack::{GeoPoint, InMemoryRoadNetwork, Observation, RoadNetwork};

pub const ORIGIN: GeoPoint = GeoPoint {
    latitude: 10.0,
    longitude: 120.0,
};

/// Street grid in local meters (east, north):
///
/// ```text
///   (0,200) ---5--- (200,200)
///      |                |
///      3                4
///      |                |
/// (-200,0) --1-- (0,0) --2-- (200,0)
/// ```
pub fn grid_edges() -> Vec<RoadEdge> {
    let edge = |id: u32, name: &str, from: u64, to: u64, a: (f64, f64), b: (f64, f64)| {
        RoadEdge::new(
            EdgeId(id),
            name,
            from,
            to,
            vec![Vector2::new(a.0, a.1), Vector2::new(b.0, b.1)],
        )
        .expect("valid fixture edge")
    };
    vec![
        edge(1, "Main St", 1, 2, (-200.0, 0.0), (0.0, 0.0)),
        edge(2, "Main St", 2, 3, (0.0, 0.0), (200.0, 0.0)),
        edge(3, "North Ave", 2, 4, (0.0, 0.0), (0.0, 200.0)),
        edge(4, "Harbor Rd", 3, 5, (200.0, 0.0), (200.0, 200.0)),
        edge(5, "Ridge Rd", 4, 5, (0.0, 200.0), (200.0, 200.0)),
    ]
}

pub fn grid_network() -> Arc<dyn RoadNetwork> {
    Arc::new(
        InMemoryRoadNetwork::new(LocalProjection::new(ORIGIN), grid_edges())
            .expect("valid fixture network"),
    )
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2012, 4, 30, 13, 30, 0).unwrap()
}

/// Fix `seconds` after the start time at a geographic position.
pub fn fix_at(vehicle_id: &str, seconds: i64, latitude: f64, longitude: f64) -> Observation {
    Observation::new(
        vehicle_id,
        start_time() + Duration::seconds(seconds),
        GeoPoint::new(latitude, longitude),
        5.0,
        90.0,
        5.0,
    )
    .expect("valid fixture observation")
}

/// Fix `seconds` after the start time at local grid coordinates.
pub fn fix_local(vehicle_id: &str, seconds: i64, east: f64, north: f64, heading: f64) -> Observation {
    let projection = LocalProjection::new(ORIGIN);
    Observation::new(
        vehicle_id,
        start_time() + Duration::seconds(seconds),
        projection.to_geo(&Vector2::new(east, north)),
        10.0,
        heading,
        5.0,
    )
    .expect("valid fixture observation")
}

/// Fixes every 5 s driving east along Main St at 10 m/s, starting at (-150, 0).
pub fn main_street_drive(vehicle_id: &str, count: usize) -> Vec<Observation> {
    (0..count)
        .map(|i| fix_local(vehicle_id, 5 * i as i64, -150.0 + 50.0 * i as f64, 1.5, 90.0))
        .collect()
}
