//! CSV data loading and synthetic drives for replaying the inference engine.
//!
//! This module provides:
//! - A struct (`FixRecord`) for reading and writing GPS fixes to/from CSV files
//! - A struct (`ResultRow`) that flattens result records into CSV rows
//! - `simulate_drive`, which walks a route and produces ground truth next to noisy fixes
//! - Unit tests for validating functionality

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use nalgebra::{Matrix2, Vector2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::belief::Belief;
use crate::earth::{LocalProjection, haversine_distance};
use crate::error::{ObservationError, SimulationError};
use crate::path::InferredPath;
use crate::recorder::ResultRecord;
use crate::road::RoadEdge;
use crate::state::{StateId, VehicleState};
use crate::{GeoPoint, Observation, wrap_to_360};

/// Struct representing a single GPS fix in a CSV file.
///
/// Several vehicles may share one file; rows are processed in file order per vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub vehicle_id: String,
    /// RFC 3339 timestamp
    pub time: DateTime<Utc>,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Ground speed in m/s
    pub velocity: f64,
    /// Heading in degrees clockwise from north
    pub heading: f64,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
}

impl FixRecord {
    /// Reads a CSV file and returns a vector of `FixRecord` structs.
    ///
    /// # Arguments
    /// * `path` - Path to the CSV file to read.
    ///
    /// # Returns
    /// * `Ok(Vec<FixRecord>)` if successful.
    /// * `Err` if the file cannot be read or parsed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, csv::Error> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Writes a slice of `FixRecord` structs to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_observation(observation: &Observation) -> Self {
        FixRecord {
            vehicle_id: observation.vehicle_id.clone(),
            time: observation.timestamp,
            latitude: observation.coordinates.latitude,
            longitude: observation.coordinates.longitude,
            velocity: observation.velocity,
            heading: observation.heading,
            accuracy: observation.accuracy,
        }
    }

    /// Validate the row and turn it into an [`Observation`].
    pub fn to_observation(&self) -> Result<Observation, ObservationError> {
        Observation::new(
            &self.vehicle_id,
            self.time,
            GeoPoint::new(self.latitude, self.longitude),
            self.velocity,
            self.heading,
            self.accuracy,
        )
    }
}

/// One result record flattened for CSV output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultRow {
    pub vehicle_id: String,
    pub time: DateTime<Utc>,
    pub observed_latitude: f64,
    pub observed_longitude: f64,
    pub inferred_latitude: Option<f64>,
    pub inferred_longitude: Option<f64>,
    pub major_axis_latitude: Option<f64>,
    pub major_axis_longitude: Option<f64>,
    pub minor_axis_latitude: Option<f64>,
    pub minor_axis_longitude: Option<f64>,
    pub edge_id: Option<u32>,
    pub edge_name: Option<String>,
    pub edge_velocity: Option<f64>,
    pub path_direction: Option<f64>,
    pub particle_count: Option<usize>,
    pub off_road_paths: Option<usize>,
    pub actual_latitude: Option<f64>,
    pub actual_longitude: Option<f64>,
    /// Distance between the inferred and the true position in meters
    pub error_m: Option<f64>,
}

impl ResultRow {
    pub fn from_record(vehicle_id: &str, record: &ResultRecord) -> Self {
        let inferred = record.inferred_results.as_ref();
        let actual = record.actual_results.as_ref();
        let edge = inferred.and_then(|r| r.inferred_edge.as_ref());
        let error_m = match (inferred, actual) {
            (Some(i), Some(a)) => Some(haversine_distance(
                i.mean_coords.latitude,
                i.mean_coords.longitude,
                a.mean_coords.latitude,
                a.mean_coords.longitude,
            )),
            _ => None,
        };
        ResultRow {
            vehicle_id: vehicle_id.to_string(),
            time: record.time,
            observed_latitude: record.observed_coords.latitude,
            observed_longitude: record.observed_coords.longitude,
            inferred_latitude: inferred.map(|r| r.mean_coords.latitude),
            inferred_longitude: inferred.map(|r| r.mean_coords.longitude),
            major_axis_latitude: inferred.map(|r| r.major_axis_coords.latitude),
            major_axis_longitude: inferred.map(|r| r.major_axis_coords.longitude),
            minor_axis_latitude: inferred.map(|r| r.minor_axis_coords.latitude),
            minor_axis_longitude: inferred.map(|r| r.minor_axis_coords.longitude),
            edge_id: edge.map(|e| e.segment.id.0),
            edge_name: edge.map(|e| e.segment.name.clone()),
            edge_velocity: edge.and_then(|e| e.velocity),
            path_direction: inferred.and_then(|r| r.path_direction),
            particle_count: inferred.map(|r| r.particle_count),
            off_road_paths: inferred.map(|r| r.off_road_paths.len()),
            actual_latitude: actual.map(|r| r.mean_coords.latitude),
            actual_longitude: actual.map(|r| r.mean_coords.longitude),
            error_m,
        }
    }

    /// Writes result rows to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(rows: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Settings of a synthetic drive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveParameters {
    /// Constant true speed along the route (m/s)
    pub speed_mps: f64,
    /// Time between fixes (s)
    pub interval_s: f64,
    /// Standard deviation of the horizontal position noise, also reported as accuracy (m)
    pub gps_std_m: f64,
    /// Standard deviation of the reported speed noise (m/s)
    pub speed_std_mps: f64,
}

impl Default for DriveParameters {
    fn default() -> Self {
        DriveParameters {
            speed_mps: 10.0,
            interval_s: 5.0,
            gps_std_m: 5.0,
            speed_std_mps: 0.5,
        }
    }
}

impl DriveParameters {
    fn validate(&self) -> Result<(), SimulationError> {
        let checks = [
            ("speed_mps", self.speed_mps, false),
            ("interval_s", self.interval_s, false),
            ("gps_std_m", self.gps_std_m, true),
            ("speed_std_mps", self.speed_std_mps, true),
        ];
        for (name, value, zero_allowed) in checks {
            let valid = value.is_finite() && (value > 0.0 || (zero_allowed && value == 0.0));
            if !valid {
                return Err(SimulationError::InvalidParameter {
                    name,
                    reason: format!("got {value}"),
                });
            }
        }
        Ok(())
    }
}

/// One simulated time step: the true state and the fix the vehicle reported.
#[derive(Clone, Debug)]
pub struct SimulatedFix {
    pub truth: VehicleState,
    pub observation: Observation,
}

/// Drive `route` from the start of its first edge at constant speed.
///
/// Every edge is traversed from its first to its last vertex. The true state is an on-road
/// belief with zero covariance; the reported fix adds seeded Gaussian noise to position and
/// speed, and reports the heading of the road. The drive ends when the next fix would fall
/// past the end of the route.
pub fn simulate_drive(
    vehicle_id: &str,
    route: &[Arc<RoadEdge>],
    projection: &LocalProjection,
    start: DateTime<Utc>,
    params: &DriveParameters,
    seed: u64,
) -> Result<Vec<SimulatedFix>, SimulationError> {
    if route.is_empty() {
        return Err(SimulationError::EmptyRoute);
    }
    params.validate()?;
    let invalid = |name: &'static str| {
        move |e: rand_distr::NormalError| SimulationError::InvalidParameter {
            name,
            reason: e.to_string(),
        }
    };
    let position_noise = Normal::new(0.0, params.gps_std_m).map_err(invalid("gps_std_m"))?;
    let speed_noise = Normal::new(0.0, params.speed_std_mps).map_err(invalid("speed_std_mps"))?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut edge_starts = Vec::with_capacity(route.len());
    let mut total = 0.0;
    for edge in route {
        edge_starts.push(total);
        total += edge.length();
    }

    let mut fixes = Vec::new();
    let mut parent: Option<StateId> = None;
    for step in 0u64.. {
        let elapsed = step as f64 * params.interval_s;
        let distance = elapsed * params.speed_mps;
        if distance > total {
            break;
        }
        let index = edge_starts
            .iter()
            .rposition(|s| *s <= distance)
            .unwrap_or(0);
        let edge = &route[index];
        let along = distance - edge_starts[index];
        let (point, tangent) = edge.point_at(along);

        let noisy = point
            + Vector2::new(
                position_noise.sample(&mut rng),
                position_noise.sample(&mut rng),
            );
        let reported_speed = (params.speed_mps + speed_noise.sample(&mut rng)).max(0.0);
        let heading = wrap_to_360(tangent.x.atan2(tangent.y).to_degrees());
        let observation = Observation::new(
            vehicle_id,
            start + Duration::milliseconds((elapsed * 1000.0).round() as i64),
            projection.to_geo(&noisy),
            reported_speed,
            heading,
            params.gps_std_m,
        )?;

        let id = StateId(step);
        let truth = VehicleState::new(
            id,
            parent,
            Belief::road(along, params.speed_mps, Matrix2::zeros()),
            InferredPath::from_edges(route[..=index].to_vec(), false),
            Arc::new(observation.clone()),
        );
        parent = Some(id);
        fixes.push(SimulatedFix { truth, observation });
    }
    Ok(fixes)
}
