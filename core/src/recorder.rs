//! Snapshots of particles into reportable results.
//!
//! A [`ResultSet`] is what the outside world sees of one particle: where it is, how uncertain
//! that is, which road it is on and how it got there. Snapshots are pure functions of the
//! particle and the context they are taken in.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::filter::FilterContext;
use crate::linalg::uncertainty_axes;
use crate::offroad::{OffRoadPath, OffRoadPathMap};
use crate::road::{EdgeSummary, RoadEdge};
use crate::state::{PosteriorDistribution, VehicleState};
use crate::{GeoPoint, Observation};

/// A road segment together with the estimated speed on it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentWithVelocity {
    #[serde(flatten)]
    pub segment: EdgeSummary,
    /// Mean along-edge speed of all particles that used this edge (m/s)
    pub velocity: Option<f64>,
}

/// Reportable view of a single particle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultSet {
    pub mean_coords: GeoPoint,
    pub major_axis_coords: GeoPoint,
    pub minor_axis_coords: GeoPoint,
    pub inferred_edge: Option<SegmentWithVelocity>,
    pub path_segments: Vec<SegmentWithVelocity>,
    /// +1 forward, -1 backward, `None` off-road
    pub path_direction: Option<f64>,
    pub particle_count: usize,
    pub off_road_paths: Vec<OffRoadPath>,
    pub state_mean: Vec<f64>,
    /// Row-major
    pub state_covariance: Vec<f64>,
}

/// Everything reported for one accepted observation.
#[derive(Clone, Debug, Serialize)]
pub struct ResultRecord {
    pub time: DateTime<Utc>,
    pub observed_coords: GeoPoint,
    /// Ground truth, only in simulation
    pub actual_results: Option<ResultSet>,
    pub inferred_results: Option<ResultSet>,
    /// Posterior the inferred results came from, retained at debug info level
    #[serde(skip)]
    pub posterior: Option<Arc<PosteriorDistribution>>,
}

/// Takes snapshots in the context of one filter generation.
#[derive(Clone, Copy, Debug)]
pub struct ResultRecorder<'a> {
    context: FilterContext<'a>,
    posterior: Option<&'a PosteriorDistribution>,
    off_road_paths: Option<&'a OffRoadPathMap>,
}

impl<'a> ResultRecorder<'a> {
    pub fn new(
        context: FilterContext<'a>,
        posterior: Option<&'a PosteriorDistribution>,
        off_road_paths: Option<&'a OffRoadPathMap>,
    ) -> Self {
        ResultRecorder {
            context,
            posterior,
            off_road_paths,
        }
    }

    /// Convert one particle into a [`ResultSet`].
    ///
    /// Off-road particles report the ends of the axes of their position uncertainty ellipse.
    /// On-road particles report both axes at the mean.
    pub fn snapshot(&self, state: &VehicleState) -> ResultSet {
        let projection = self.context.projection;
        let ground = state.ground_belief();
        let mean = ground.ground_position();
        let (major, minor) = if state.is_off_road() {
            let (major, minor) = uncertainty_axes(&ground.ground_position_covariance());
            (mean + major, mean + minor)
        } else {
            (mean, mean)
        };
        let particle_count = self
            .posterior
            .map(|p| p.count_of(state.id()))
            .filter(|count| *count > 0)
            .unwrap_or(1);
        let off_road_paths = self
            .off_road_paths
            .and_then(|m| m.get(&state.id()).cloned())
            .unwrap_or_default();
        ResultSet {
            mean_coords: projection.to_geo(&mean),
            major_axis_coords: projection.to_geo(&major),
            minor_axis_coords: projection.to_geo(&minor),
            inferred_edge: state.edge().map(|edge| self.segment(edge)),
            path_segments: state
                .path()
                .edges()
                .iter()
                .map(|path_edge| self.segment(path_edge.edge()))
                .collect(),
            path_direction: state.path().direction(),
            particle_count,
            off_road_paths,
            state_mean: ground.mean().iter().cloned().collect(),
            state_covariance: ground.covariance().transpose().iter().cloned().collect(),
        }
    }

    /// Result record for `observation` with optional ground truth and inferred particle.
    pub fn record(
        &self,
        observation: &Observation,
        actual: Option<&VehicleState>,
        inferred: Option<&VehicleState>,
    ) -> ResultRecord {
        ResultRecord {
            time: observation.timestamp,
            observed_coords: observation.coordinates,
            actual_results: actual.map(|state| self.snapshot(state)),
            inferred_results: inferred.map(|state| self.snapshot(state)),
            posterior: None,
        }
    }

    fn segment(&self, edge: &RoadEdge) -> SegmentWithVelocity {
        SegmentWithVelocity {
            segment: EdgeSummary::from_edge(edge, self.context.projection),
            velocity: self.context.edge_velocities.mean(edge.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::belief::Belief;
    use crate::earth::LocalProjection;
    use crate::filter::EdgeVelocities;
    use crate::linalg::ELLIPSE_SCALE;
    use crate::path::InferredPath;
    use crate::road::EdgeId;
    use crate::state::StateId;
    use assert_approx_eq::assert_approx_eq;
    use chrono::TimeZone;
    use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

    fn observation() -> Arc<Observation> {
        Arc::new(
            Observation::new(
                "veh",
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                GeoPoint::new(10.0, 120.0),
                0.0,
                0.0,
                1.0,
            )
            .unwrap(),
        )
    }

    #[test]
    fn zero_covariance_ellipse_collapses_to_mean() {
        let projection = LocalProjection::new(GeoPoint::new(10.0, 120.0));
        let velocities = EdgeVelocities::default();
        let recorder = ResultRecorder::new(FilterContext::new(&projection, &velocities), None, None);
        let state = VehicleState::new(
            StateId(1),
            None,
            Belief::new(DVector::from_vec(vec![30.0, 1.0, -15.0, 0.0]), DMatrix::zeros(4, 4)),
            InferredPath::empty(),
            observation(),
        );
        let result = recorder.snapshot(&state);
        assert_eq!(result.major_axis_coords, result.mean_coords);
        assert_eq!(result.minor_axis_coords, result.mean_coords);
        assert_eq!(result.path_direction, None);
        assert!(result.inferred_edge.is_none());
        assert!(result.path_segments.is_empty());
        assert_eq!(result.particle_count, 1);
        assert!(result.off_road_paths.is_empty());
        let local = projection.to_local(&result.mean_coords);
        assert_approx_eq!(local.x, 30.0, 1e-6);
        assert_approx_eq!(local.y, -15.0, 1e-6);
    }

    #[test]
    fn off_road_ellipse_is_scaled() {
        let projection = LocalProjection::new(GeoPoint::new(0.0, 0.0));
        let velocities = EdgeVelocities::default();
        let recorder = ResultRecorder::new(FilterContext::new(&projection, &velocities), None, None);
        let state = VehicleState::new(
            StateId(1),
            None,
            Belief::ground(Vector2::zeros(), Vector2::zeros(), 4.0, 1.0),
            InferredPath::empty(),
            observation(),
        );
        let result = recorder.snapshot(&state);
        let major = projection.to_local(&result.major_axis_coords);
        assert_approx_eq!(major.norm(), ELLIPSE_SCALE * 2.0, 1e-6);
    }

    #[test]
    fn on_road_snapshot_reports_edge_and_multiplicity() {
        let projection = LocalProjection::new(GeoPoint::new(10.0, 120.0));
        let mut velocities = EdgeVelocities::default();
        velocities.observe(EdgeId(8), 12.0, 1.0);
        let edge = Arc::new(
            crate::road::RoadEdge::new(
                EdgeId(8),
                "Harbor Rd",
                1,
                2,
                vec![Vector2::new(0.0, 0.0), Vector2::new(200.0, 0.0)],
            )
            .unwrap(),
        );
        let state = VehicleState::new(
            StateId(3),
            None,
            Belief::road(50.0, -12.0, Matrix2::new(25.0, 0.0, 0.0, 4.0)),
            InferredPath::single(edge, true),
            observation(),
        );
        let posterior = PosteriorDistribution::new(vec![(state.clone(), 7)]);
        let mut paths = OffRoadPathMap::new();
        paths.insert(StateId(3), vec![OffRoadPath::default()]);
        let recorder = ResultRecorder::new(
            FilterContext::new(&projection, &velocities),
            Some(&posterior),
            Some(&paths),
        );
        let result = recorder.snapshot(&state);
        assert_eq!(result.major_axis_coords, result.mean_coords);
        assert_eq!(result.path_direction, Some(-1.0));
        assert_eq!(result.particle_count, 7);
        assert_eq!(result.off_road_paths.len(), 1);
        let inferred = result.inferred_edge.unwrap();
        assert_eq!(inferred.segment.name, "Harbor Rd");
        assert_eq!(inferred.velocity, Some(12.0));
        assert_eq!(result.path_segments.len(), 1);
        assert_eq!(result.state_mean.len(), 4);
        assert_approx_eq!(result.state_mean[1], -12.0, 1e-12);

        let record = recorder.record(&observation(), Some(&state), Some(&state));
        assert!(record.actual_results.is_some());
        assert_eq!(record.observed_coords, GeoPoint::new(10.0, 120.0));
    }
}
