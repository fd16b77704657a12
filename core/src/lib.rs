//! Road-constrained vehicle location inference
//!
//! This crate tracks individual vehicles from noisy GPS fixes. Each vehicle is followed by its
//! own particle filter whose particles carry a linear-Gaussian (Kalman) belief that is either
//! free in the local ground plane (off-road) or constrained to the 1-D length of a road edge
//! (on-road). The filter only samples the discrete choice of road edge, everything continuous
//! is handled in closed form, which keeps particle counts small.
//!
//! Around the filter sits the per-vehicle bookkeeping needed to run it as a service: an
//! admission gate that drops stale fixes and restarts tracking after long gaps, lineage-aware
//! reconstruction of off-road excursions across resampling, snapshotting of the posterior into
//! reportable results, and a registry that owns one inference instance per vehicle.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Kalman beliefs and the linear algebra behind them.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): seeded resampling and simulation noise.
//! - [`petgraph`](https://crates.io/crates/petgraph): path search on the reference road network.
//! - [`rayon`](https://crates.io/crates/rayon): processing many vehicles in parallel.
//!
//! ## Crate overview
//!
//! - [earth]: WGS84 constants and the local tangent-plane projection.
//! - [linalg]: symmetric solves, Gaussian likelihoods and uncertainty ellipses.
//! - [road]: the read-only road network contract and an in-memory implementation.
//! - [path]: inferred paths over road edges.
//! - [belief]: Kalman beliefs and the ground/road motion models.
//! - [state]: particles and the counted posterior distribution.
//! - [filter]: the road-constrained filter contract, shared model and constructor registry.
//! - [particle]: resampling and the bootstrap filter.
//! - [learning]: the particle-learning filter.
//! - [offroad]: lineage-based off-road path tracking.
//! - [recorder]: result snapshots.
//! - [instance]: the per-vehicle inference instance and its admission gate.
//! - [registry]: the directory of inference instances.
//! - [config]: configuration types and file IO.
//! - [sim]: CSV IO and synthetic drives with ground truth.
pub mod belief;
pub mod config;
pub mod earth;
pub mod error;
pub mod filter;
pub mod instance;
pub mod learning;
pub mod linalg;
pub mod offroad;
pub mod particle;
pub mod path;
pub mod recorder;
pub mod registry;
pub mod road;
pub mod sim;
pub mod state;

use std::fmt::{self, Display};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::config::{FilterParameters, InferenceConfig, InfoLevel, RegistrationPolicy};
pub use crate::error::{FilterError, InferenceError, ObservationError};
pub use crate::filter::FilterKind;
pub use crate::instance::{InferenceInstance, UpdateOutcome};
pub use crate::registry::InstanceRegistry;
pub use crate::road::{InMemoryRoadNetwork, RoadNetwork};

/// Timestamp layout of the compact location record format, e.g. `20120430T133023`.
pub const RECORD_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// A WGS84 position in decimal degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoPoint {
            latitude,
            longitude,
        }
    }
}

impl Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.7}, {:.7})", self.latitude, self.longitude)
    }
}

/// A single GPS fix reported by a vehicle.
///
/// Observations are immutable once built and are shared between the particles, result
/// records and off-road paths that reference them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    pub coordinates: GeoPoint,
    /// Reported ground speed in m/s
    pub velocity: f64,
    /// Reported heading in degrees clockwise from north, in [0, 360)
    pub heading: f64,
    /// Reported horizontal accuracy (one sigma) in meters
    pub accuracy: f64,
}

impl Observation {
    /// Build a validated observation. Heading is wrapped into [0, 360).
    pub fn new(
        vehicle_id: &str,
        timestamp: DateTime<Utc>,
        coordinates: GeoPoint,
        velocity: f64,
        heading: f64,
        accuracy: f64,
    ) -> Result<Self, ObservationError> {
        if vehicle_id.trim().is_empty() {
            return Err(ObservationError::EmptyVehicleId);
        }
        check_range("latitude", coordinates.latitude, -90.0, 90.0)?;
        check_range("longitude", coordinates.longitude, -180.0, 180.0)?;
        check_range("velocity", velocity, 0.0, f64::MAX)?;
        check_range("heading", heading, f64::MIN, f64::MAX)?;
        check_range("accuracy", accuracy, 0.0, f64::MAX)?;
        let mut heading = wrap_to_360(heading);
        if heading >= 360.0 {
            heading -= 360.0;
        }
        Ok(Observation {
            vehicle_id: vehicle_id.trim().to_string(),
            timestamp,
            coordinates,
            velocity,
            heading,
            accuracy,
        })
    }

    /// Parse one record of the form `yyyyMMddTHHmmss,lat,lon,velocity,heading,gpsError`.
    ///
    /// # Example
    /// ```rust
    /// use roadtrack::Observation;
    /// let obs = Observation::parse_record("bus-7", "20120430T133023,10.0,120.0,5.0,90.0,4.0").unwrap();
    /// assert_eq!(obs.heading, 90.0);
    /// assert_eq!(obs.accuracy, 4.0);
    /// ```
    pub fn parse_record(vehicle_id: &str, line: &str) -> Result<Self, ObservationError> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() != 6 {
            return Err(ObservationError::FieldCount(fields.len()));
        }
        let timestamp = NaiveDateTime::parse_from_str(fields[0], RECORD_TIME_FORMAT)
            .map_err(|_| ObservationError::Timestamp(fields[0].to_string()))?
            .and_utc();
        let latitude = parse_field("latitude", fields[1])?;
        let longitude = parse_field("longitude", fields[2])?;
        let velocity = parse_field("velocity", fields[3])?;
        let heading = parse_field("heading", fields[4])?;
        let accuracy = parse_field("accuracy", fields[5])?;
        Observation::new(
            vehicle_id,
            timestamp,
            GeoPoint::new(latitude, longitude),
            velocity,
            heading,
            accuracy,
        )
    }

    /// Parse a newline separated batch of records. Any malformed line rejects the whole batch.
    pub fn parse_batch(vehicle_id: &str, body: &str) -> Result<Vec<Self>, ObservationError> {
        let observations = body
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                Observation::parse_record(vehicle_id, line).map_err(|source| {
                    ObservationError::InvalidRecord {
                        line: index + 1,
                        source: Box::new(source),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if observations.is_empty() {
            return Err(ObservationError::EmptyBatch);
        }
        Ok(observations)
    }

    /// Seconds elapsed from `earlier` to this observation, with millisecond resolution.
    pub fn seconds_since(&self, earlier: DateTime<Utc>) -> f64 {
        (self.timestamp - earlier).num_milliseconds() as f64 / 1000.0
    }
}

impl Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("vehicle_id", &self.vehicle_id)
            .field("timestamp", &self.timestamp.format(RECORD_TIME_FORMAT).to_string())
            .field("coordinates", &self.coordinates.to_string())
            .field("velocity", &self.velocity)
            .field("heading", &self.heading)
            .field("accuracy", &self.accuracy)
            .finish()
    }
}

fn parse_field(field: &'static str, value: &str) -> Result<f64, ObservationError> {
    value.parse::<f64>().map_err(|_| ObservationError::Number {
        field,
        value: value.to_string(),
    })
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ObservationError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ObservationError::OutOfRange { field, value })
    }
}

/// Wrap an angle to the range -180 to 180 degrees
///
/// # Example
/// ```rust
/// use roadtrack::wrap_to_180;
/// assert_eq!(wrap_to_180(190.0), -170.0);
/// ```
pub fn wrap_to_180<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped > T::from(180.0) {
        wrapped -= T::from(360.0);
    }
    while wrapped < T::from(-180.0) {
        wrapped += T::from(360.0);
    }
    wrapped
}
/// Wrap an angle to the range 0 to 360 degrees
///
/// # Example
/// ```rust
/// use roadtrack::wrap_to_360;
/// assert_eq!(wrap_to_360(370.0), 10.0);
/// ```
pub fn wrap_to_360<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped > T::from(360.0) {
        wrapped -= T::from(360.0);
    }
    while wrapped < T::from(0.0) {
        wrapped += T::from(360.0);
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wrap_to_180() {
        assert_eq!(super::wrap_to_180(190.0), -170.0);
        assert_eq!(super::wrap_to_180(-190.0), 170.0);
        assert_eq!(super::wrap_to_180(0.0), 0.0);
    }
    #[test]
    fn test_wrap_to_360() {
        assert_eq!(super::wrap_to_360(370.0), 10.0);
        assert_eq!(super::wrap_to_360(-10.0), 350.0);
    }
    #[test]
    fn parse_record_fields() {
        let obs = Observation::parse_record("veh-1", "20120430T133023,10.0005,120.0005,5.5,-90,3.0")
            .expect("record should parse");
        assert_eq!(obs.vehicle_id, "veh-1");
        assert_eq!(
            obs.timestamp,
            Utc.with_ymd_and_hms(2012, 4, 30, 13, 30, 23).unwrap()
        );
        assert_eq!(obs.coordinates, GeoPoint::new(10.0005, 120.0005));
        assert_eq!(obs.velocity, 5.5);
        assert_eq!(obs.heading, 270.0);
        assert_eq!(obs.accuracy, 3.0);
    }
    #[test]
    fn parse_record_rejects_wrong_field_count() {
        let err = Observation::parse_record("veh-1", "20120430T133023,10.0,120.0,5.5,90").unwrap_err();
        assert_eq!(err, ObservationError::FieldCount(5));
    }
    #[test]
    fn parse_record_rejects_bad_values() {
        assert!(matches!(
            Observation::parse_record("veh-1", "2012-04-30 13:30:23,10,120,5,90,3"),
            Err(ObservationError::Timestamp(_))
        ));
        assert!(matches!(
            Observation::parse_record("veh-1", "20120430T133023,abc,120,5,90,3"),
            Err(ObservationError::Number { field: "latitude", .. })
        ));
        assert!(matches!(
            Observation::parse_record("veh-1", "20120430T133023,95,120,5,90,3"),
            Err(ObservationError::OutOfRange { field: "latitude", .. })
        ));
        assert!(matches!(
            Observation::parse_record("veh-1", "20120430T133023,10,120,-5,90,3"),
            Err(ObservationError::OutOfRange { field: "velocity", .. })
        ));
        assert!(matches!(
            Observation::parse_record(" ", "20120430T133023,10,120,5,90,3"),
            Err(ObservationError::EmptyVehicleId)
        ));
    }
    #[test]
    fn parse_batch_rejects_whole_body_on_one_bad_line() {
        let body = "20120430T133023,10.0,120.0,5,90,3\n20120430T133024,10.0,oops,5,90,3\n";
        let err = Observation::parse_batch("veh-1", body).unwrap_err();
        assert!(matches!(err, ObservationError::InvalidRecord { line: 2, .. }));
        assert_eq!(
            Observation::parse_batch("veh-1", "\n \n").unwrap_err(),
            ObservationError::EmptyBatch
        );
    }
    #[test]
    fn seconds_since_has_millisecond_resolution() {
        let t0 = Utc.with_ymd_and_hms(2012, 4, 30, 13, 30, 23).unwrap();
        let obs = Observation::new(
            "veh-1",
            t0 + chrono::Duration::milliseconds(1500),
            GeoPoint::new(10.0, 120.0),
            0.0,
            0.0,
            1.0,
        )
        .unwrap();
        assert_eq!(obs.seconds_since(t0), 1.5);
        assert_eq!(obs.seconds_since(obs.timestamp), 0.0);
    }
}
