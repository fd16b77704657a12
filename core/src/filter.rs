//! Road-constrained filtering: the filter contract, the shared road tracking model and the
//! constructor registry.
//!
//! Every particle carries a Kalman belief, so the only thing a filter samples is the discrete
//! choice the vehicle made since the last fix: stay off-road, or be on one of the candidate
//! road edges near the fix. [`RoadTrackingModel`] enumerates those choices (hypotheses) for a
//! particle, predicting and correcting the belief in closed form for each one and scoring it
//! by its transition prior and observation likelihood. The variants differ only in how they
//! turn hypothesis scores into the next generation of particles:
//!
//! - [`crate::particle::BootstrapFilter`] samples hypotheses from the transition prior and
//!   weights them by likelihood before resampling.
//! - [`crate::learning::ParticleLearningFilter`] resamples parents by their predictive
//!   likelihood first, then samples each survivor's hypothesis from its posterior.
//!
//! Filters are built from a [`FilterKind`] through a plain function-pointer registry, see
//! [`FilterKind::constructor`].
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::Observation;
use crate::belief::{
    Belief, MotionModel, ground_observation_matrix, ground_to_road, road_observation_matrix,
    road_to_ground,
};
use crate::config::FilterParameters;
use crate::earth::LocalProjection;
use crate::error::FilterError;
use crate::learning::ParticleLearningFilter;
use crate::linalg::gaussian_log_likelihood;
use crate::particle::{BootstrapFilter, multinomial_counts, normalize_log_weights};
use crate::path::InferredPath;
use crate::road::{EdgeId, RoadEdge, RoadNetwork};
use crate::state::{PosteriorDistribution, StateId, StateIdAllocator, VehicleState};

/// A particle filter over vehicle states constrained to a road network.
pub trait RoadTrackingFilter: Send + Debug {
    fn kind(&self) -> FilterKind;

    /// Predict, correct and resample `prior` against `observation`.
    ///
    /// The returned posterior always holds exactly `num_particles` particles by count.
    fn update(
        &mut self,
        prior: &PosteriorDistribution,
        observation: &Arc<Observation>,
    ) -> PosteriorDistribution;

    /// Timestamp of the last observation this filter consumed.
    fn last_processed_time(&self) -> DateTime<Utc>;

    /// Read-only view of what the result recorder needs from the filter.
    fn context(&self) -> FilterContext<'_>;
}

/// Builds a filter from the first observation of a vehicle and returns it together with the
/// initial posterior.
pub type FilterConstructor = fn(
    &Arc<Observation>,
    Arc<dyn RoadNetwork>,
    &FilterParameters,
    u64,
) -> Result<(Box<dyn RoadTrackingFilter>, PosteriorDistribution), FilterError>;

/// The available filter variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    #[default]
    Bootstrap,
    #[serde(alias = "pl")]
    ParticleLearning,
}

impl FilterKind {
    pub const ALL: [FilterKind; 2] = [FilterKind::Bootstrap, FilterKind::ParticleLearning];

    /// Constructor registered for this variant.
    pub fn constructor(self) -> FilterConstructor {
        match self {
            FilterKind::Bootstrap => BootstrapFilter::construct,
            FilterKind::ParticleLearning => ParticleLearningFilter::construct,
        }
    }

    pub fn initialize(
        self,
        first: &Arc<Observation>,
        network: Arc<dyn RoadNetwork>,
        params: &FilterParameters,
        seed: u64,
    ) -> Result<(Box<dyn RoadTrackingFilter>, PosteriorDistribution), FilterError> {
        (self.constructor())(first, network, params, seed)
    }
}

impl Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::Bootstrap => write!(f, "bootstrap"),
            FilterKind::ParticleLearning => write!(f, "particle-learning"),
        }
    }
}

impl FromStr for FilterKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "bootstrap" => Ok(FilterKind::Bootstrap),
            "particle-learning" | "pl" => Ok(FilterKind::ParticleLearning),
            other => Err(FilterError::UnknownKind(other.to_string())),
        }
    }
}

/// Projection and per-edge velocity estimates, as seen by the result recorder.
#[derive(Clone, Copy, Debug)]
pub struct FilterContext<'a> {
    pub projection: &'a LocalProjection,
    pub edge_velocities: &'a EdgeVelocities,
}

impl<'a> FilterContext<'a> {
    pub fn new(projection: &'a LocalProjection, edge_velocities: &'a EdgeVelocities) -> Self {
        FilterContext {
            projection,
            edge_velocities,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct RunningStats {
    weight: f64,
    mean: f64,
    m2: f64,
}

/// Weighted running mean and variance of along-edge speed for every edge particles used.
#[derive(Clone, Debug, Default)]
pub struct EdgeVelocities {
    stats: HashMap<EdgeId, RunningStats>,
}

impl EdgeVelocities {
    pub fn observe(&mut self, edge: EdgeId, speed: f64, weight: f64) {
        if !speed.is_finite() || weight <= 0.0 {
            return;
        }
        let s = self.stats.entry(edge).or_default();
        s.weight += weight;
        let delta = speed - s.mean;
        s.mean += delta * weight / s.weight;
        s.m2 += weight * delta * (speed - s.mean);
    }
    pub fn mean(&self, edge: EdgeId) -> Option<f64> {
        self.stats.get(&edge).map(|s| s.mean)
    }
    pub fn variance(&self, edge: EdgeId) -> Option<f64> {
        self.stats
            .get(&edge)
            .filter(|s| s.weight > 0.0)
            .map(|s| s.m2 / s.weight)
    }
    pub fn len(&self) -> usize {
        self.stats.len()
    }
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// One way a particle may have moved since the previous fix.
#[derive(Clone, Debug)]
pub struct Hypothesis {
    /// Predicted belief in this hypothesis' regime, before the observation
    pub prior_belief: Belief,
    /// Belief after the observation
    pub belief: Belief,
    /// Empty for the off-road hypothesis
    pub path: InferredPath,
    pub log_prior: f64,
    pub log_likelihood: f64,
}

impl Hypothesis {
    pub fn is_off_road(&self) -> bool {
        self.path.is_empty()
    }
    pub fn log_joint(&self) -> f64 {
        self.log_prior + self.log_likelihood
    }
}

/// Motion, observation and road-transition model shared by the filter variants.
#[derive(Clone)]
pub struct RoadTrackingModel {
    network: Arc<dyn RoadNetwork>,
    params: FilterParameters,
    motion: MotionModel,
}

impl Debug for RoadTrackingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoadTrackingModel")
            .field("params", &self.params)
            .field("motion", &self.motion)
            .finish()
    }
}

impl RoadTrackingModel {
    pub fn new(network: Arc<dyn RoadNetwork>, params: FilterParameters) -> Self {
        RoadTrackingModel {
            motion: params.motion_model(),
            network,
            params,
        }
    }

    pub fn network(&self) -> &Arc<dyn RoadNetwork> {
        &self.network
    }
    pub fn parameters(&self) -> &FilterParameters {
        &self.params
    }

    /// Observation standard deviation: the reported accuracy, floored.
    pub fn observation_std(&self, observation: &Observation) -> f64 {
        observation.accuracy.max(self.params.min_observation_std_m)
    }

    pub fn observed_location(&self, observation: &Observation) -> Vector2<f64> {
        self.network.projection().to_local(&observation.coordinates)
    }

    /// Ground belief at the fix, moving with the reported speed and heading.
    pub fn initial_belief(&self, observation: &Observation) -> Belief {
        let heading = observation.heading.to_radians();
        let velocity = Vector2::new(
            observation.velocity * heading.sin(),
            observation.velocity * heading.cos(),
        );
        let sigma = self.observation_std(observation);
        Belief::ground(
            self.observed_location(observation),
            velocity,
            sigma * sigma,
            self.params.initial_velocity_variance,
        )
    }

    pub fn predict(&self, state: &VehicleState, dt: f64) -> Belief {
        self.motion.predict(state.belief(), dt)
    }

    /// Enumerate the hypotheses for a particle whose belief was predicted `dt` seconds ahead
    /// to the time of `observation`. `previous` is `None` while initializing.
    ///
    /// A particle leaving the road is predicted with the ground model from its last road
    /// position, so it picks up uncertainty across the road as well as along it.
    pub fn hypotheses(
        &self,
        previous: Option<&VehicleState>,
        predicted: &Belief,
        observation: &Observation,
        dt: f64,
    ) -> Vec<Hypothesis> {
        let z = self.observed_location(observation);
        let sigma = self.observation_std(observation);
        let variance = sigma * sigma;
        let current_edge = previous
            .and_then(|s| s.edge())
            .filter(|_| predicted.is_road());
        let ground_predicted = match current_edge {
            Some(edge) => road_to_ground(predicted, edge),
            None => predicted.clone(),
        };
        let transitions = &self.params.transitions;
        let (p_off, p_on) = match previous.map(|s| s.is_off_road()) {
            None => (transitions.initial_off_road, 1.0 - transitions.initial_off_road),
            Some(false) => (transitions.on_to_off, 1.0 - transitions.on_to_off),
            Some(true) => (1.0 - transitions.off_to_on, transitions.off_to_on),
        };

        let leaving = match (previous, current_edge) {
            (Some(state), Some(edge)) => self.motion.predict(&road_to_ground(state.belief(), edge), dt),
            _ => ground_predicted.clone(),
        };
        let mut hypotheses = Vec::new();
        let o = ground_observation_matrix();
        let r = DMatrix::<f64>::identity(2, 2) * variance;
        let z_ground = DVector::from_vec(vec![z.x, z.y]);
        hypotheses.push(Hypothesis {
            belief: leaving.correct(&o, &r, &z_ground),
            log_likelihood: leaving.innovation_log_likelihood(&o, &r, &z_ground),
            prior_belief: leaving,
            path: InferredPath::empty(),
            log_prior: p_off.ln(),
        });

        let mut candidates = self.network.nearest_edges(&z, self.search_radius(&ground_predicted, sigma));
        if let Some(edge) = current_edge
            && !candidates.iter().any(|e| e.id() == edge.id())
        {
            candidates.insert(0, Arc::clone(edge));
        }
        if candidates.is_empty() {
            return hypotheses;
        }
        let log_edge_prior = p_on.ln() - (candidates.len() as f64).ln();
        let h = road_observation_matrix();
        let r_road = DMatrix::from_element(1, 1, variance);
        for edge in candidates {
            let road_predicted = match current_edge {
                Some(current) if current.id() == edge.id() => predicted.clone(),
                _ => ground_to_road(&ground_predicted, &edge),
            };
            let (point, u) = edge.point_at(road_predicted.mean()[0]);
            let along_variance = road_predicted.covariance()[(0, 0)];
            let s: Matrix2<f64> = u * u.transpose() * along_variance + Matrix2::identity() * variance;
            let log_likelihood = gaussian_log_likelihood(
                &DVector::from_vec(vec![z.x - point.x, z.y - point.y]),
                &DMatrix::from_iterator(2, 2, s.iter().cloned()),
            );
            let measured = DVector::from_element(1, edge.project(&z).distance_along);
            let belief = road_predicted.correct(&h, &r_road, &measured);
            let path = self.path_to(previous, &edge, &belief);
            hypotheses.push(Hypothesis {
                prior_belief: road_predicted,
                belief,
                path,
                log_prior: log_edge_prior,
                log_likelihood,
            });
        }
        hypotheses
    }

    /// Candidate search radius: three sigma of the combined prediction and fix uncertainty,
    /// kept within the configured bounds.
    fn search_radius(&self, ground_predicted: &Belief, sigma: f64) -> f64 {
        let p = ground_predicted.ground_position_covariance();
        let spread = p[(0, 0)].max(p[(1, 1)]).max(0.0).sqrt();
        (3.0 * (spread + sigma)).clamp(
            self.params.edge_search_radius_m,
            self.params.max_edge_search_radius_m,
        )
    }

    /// Path a particle took from its previous location onto `edge`.
    fn path_to(&self, previous: Option<&VehicleState>, edge: &Arc<RoadEdge>, belief: &Belief) -> InferredPath {
        let is_backward = belief.mean()[1] < 0.0;
        match previous.filter(|s| s.edge().is_some_and(|e| e.id() != edge.id())) {
            Some(state) => {
                let to = edge.point_at(belief.mean()[0]).0;
                let mut edges = self.network.connecting_path(&state.mean_location(), &to);
                match edges.iter().position(|e| e.id() == edge.id()) {
                    Some(i) => edges.truncate(i + 1),
                    None => edges.push(Arc::clone(edge)),
                }
                InferredPath::from_edges(edges, is_backward)
            }
            None => InferredPath::single(Arc::clone(edge), is_backward),
        }
    }
}

/// A particle of the next generation before it receives its id.
#[derive(Clone, Debug)]
pub struct Child {
    pub parent: Option<StateId>,
    pub belief: Belief,
    pub path: InferredPath,
    pub count: usize,
}

/// State shared by both filter variants: the model, the seeded generator, id allocation,
/// the processing clock and the per-edge velocity estimates.
#[derive(Debug)]
pub struct FilterCommon {
    pub(crate) model: RoadTrackingModel,
    pub(crate) rng: StdRng,
    ids: StateIdAllocator,
    last_processed: DateTime<Utc>,
    edge_velocities: EdgeVelocities,
}

impl FilterCommon {
    pub fn new(
        network: Arc<dyn RoadNetwork>,
        params: &FilterParameters,
        seed: u64,
        first: &Observation,
    ) -> Result<Self, FilterError> {
        params.validate()?;
        Ok(FilterCommon {
            model: RoadTrackingModel::new(network, *params),
            rng: StdRng::seed_from_u64(seed),
            ids: StateIdAllocator::default(),
            last_processed: first.timestamp,
            edge_velocities: EdgeVelocities::default(),
        })
    }

    pub fn model(&self) -> &RoadTrackingModel {
        &self.model
    }
    pub fn num_particles(&self) -> usize {
        self.model.params.num_particles
    }
    pub fn last_processed(&self) -> DateTime<Utc> {
        self.last_processed
    }
    pub fn elapsed(&self, observation: &Observation) -> f64 {
        observation.seconds_since(self.last_processed)
    }

    /// Draw the first generation around `observation`, without conditioning on it twice.
    pub fn initial_posterior(&mut self, observation: &Arc<Observation>) -> PosteriorDistribution {
        let belief = self.model.initial_belief(observation);
        let hypotheses = self.model.hypotheses(None, &belief, observation, 0.0);
        let log_joint: Vec<f64> = hypotheses.iter().map(Hypothesis::log_joint).collect();
        let counts = multinomial_counts(
            &normalize_log_weights(&log_joint),
            self.num_particles(),
            &mut self.rng,
        );
        let children = hypotheses
            .into_iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|(h, count)| Child {
                parent: None,
                belief: h.prior_belief,
                path: h.path,
                count,
            })
            .collect();
        self.commit(observation, children)
    }

    /// Give the children ids, fold them into the edge velocity estimates and advance the
    /// clock to `observation`.
    pub fn commit(&mut self, observation: &Arc<Observation>, children: Vec<Child>) -> PosteriorDistribution {
        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            let state = VehicleState::new(
                self.ids.next_id(),
                child.parent,
                child.belief,
                child.path,
                Arc::clone(observation),
            );
            if let (Some(edge), Some(speed)) = (state.edge(), state.along_edge_speed()) {
                self.edge_velocities
                    .observe(edge.id(), speed.abs(), child.count as f64);
            }
            entries.push((state, child.count));
        }
        self.last_processed = observation.timestamp;
        PosteriorDistribution::new(entries)
    }

    pub fn context(&self) -> FilterContext<'_> {
        FilterContext::new(self.model.network.projection(), &self.edge_velocities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;
    use crate::road::InMemoryRoadNetwork;
    use assert_approx_eq::assert_approx_eq;
    use chrono::TimeZone;

    fn network() -> Arc<dyn RoadNetwork> {
        let projection = LocalProjection::new(GeoPoint::new(10.0, 120.0));
        let edge = RoadEdge::new(
            EdgeId(1),
            "east",
            1,
            2,
            vec![Vector2::new(-200.0, 0.0), Vector2::new(500.0, 0.0)],
        )
        .unwrap();
        Arc::new(InMemoryRoadNetwork::new(projection, vec![edge]).unwrap())
    }

    fn observation_at(network: &Arc<dyn RoadNetwork>, east: f64, north: f64) -> Arc<Observation> {
        let point = network.projection().to_geo(&Vector2::new(east, north));
        Arc::new(
            Observation::new(
                "veh",
                Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
                point,
                5.0,
                90.0,
                4.0,
            )
            .unwrap(),
        )
    }

    #[test]
    fn kind_names_parse() {
        assert_eq!("bootstrap".parse::<FilterKind>().unwrap(), FilterKind::Bootstrap);
        assert_eq!(
            "pl".parse::<FilterKind>().unwrap(),
            FilterKind::ParticleLearning
        );
        assert_eq!(
            "kalman".parse::<FilterKind>().unwrap_err(),
            FilterError::UnknownKind("kalman".to_string())
        );
        for kind in FilterKind::ALL {
            assert_eq!(kind.to_string().parse::<FilterKind>().unwrap(), kind);
        }
    }

    #[test]
    fn hypotheses_cover_off_road_and_nearby_edges() {
        let network = network();
        let model = RoadTrackingModel::new(Arc::clone(&network), FilterParameters::default());
        let obs = observation_at(&network, 20.0, 3.0);
        let initial = model.initial_belief(&obs);
        assert_approx_eq!(initial.ground_velocity().x, 5.0, 1e-9);
        assert_approx_eq!(initial.ground_velocity().y, 0.0, 1e-9);

        let hypotheses = model.hypotheses(None, &initial, &obs, 0.0);
        assert_eq!(hypotheses.len(), 2);
        assert!(hypotheses[0].is_off_road());
        let on_road = &hypotheses[1];
        assert_eq!(on_road.path.edge_ids(), vec![EdgeId(1)]);
        assert!(on_road.belief.is_road());
        // 220 m along the edge, moving forward
        assert_approx_eq!(on_road.belief.mean()[0], 220.0, 1.0);
        assert!(on_road.belief.mean()[1] > 0.0);
        let p = FilterParameters::default().transitions;
        assert_approx_eq!(hypotheses[0].log_prior, p.initial_off_road.ln(), 1e-12);
        assert_approx_eq!(on_road.log_prior, (1.0 - p.initial_off_road).ln(), 1e-12);
    }

    #[test]
    fn far_fix_only_has_the_off_road_hypothesis() {
        let network = network();
        let model = RoadTrackingModel::new(Arc::clone(&network), FilterParameters::default());
        let obs = observation_at(&network, 0.0, 2000.0);
        let hypotheses = model.hypotheses(None, &model.initial_belief(&obs), &obs, 0.0);
        assert_eq!(hypotheses.len(), 1);
        assert!(hypotheses[0].is_off_road());
    }

    #[test]
    fn leaving_the_road_spreads_across_it() {
        let network = network();
        let model = RoadTrackingModel::new(Arc::clone(&network), FilterParameters::default());
        let edge = network.edge_info(EdgeId(1)).unwrap();
        let previous = VehicleState::new(
            StateId(1),
            None,
            Belief::road(200.0, 5.0, Matrix2::identity()),
            InferredPath::single(edge, false),
            observation_at(&network, 0.0, 0.0),
        );
        let predicted = model.predict(&previous, 5.0);
        let obs = observation_at(&network, 25.0, 40.0);
        let hypotheses = model.hypotheses(Some(&previous), &predicted, &obs, 5.0);
        let leaving = &hypotheses[0];
        assert!(leaving.is_off_road());
        assert!(leaving.prior_belief.ground_position_covariance()[(1, 1)] > 1.0);
        // the correction pulls the off-road belief towards the fix
        assert!(leaving.belief.ground_position().y > 10.0);
        // the current edge stays a candidate even when the fix is far from it
        assert!(hypotheses.iter().skip(1).any(|h| h.path.edge_ids() == vec![EdgeId(1)]));
    }

    #[test]
    fn initial_posterior_holds_every_particle() {
        let network = network();
        let obs = observation_at(&network, 20.0, 1.0);
        let mut common =
            FilterCommon::new(network, &FilterParameters::default(), 3, &obs).unwrap();
        let posterior = common.initial_posterior(&obs);
        assert_eq!(posterior.total_count(), 50);
        assert!(posterior.states().all(|s| s.parent().is_none()));
        assert_eq!(common.last_processed(), obs.timestamp);
        assert!(common.context().edge_velocities.mean(EdgeId(1)).is_some());
    }

    #[test]
    fn invalid_parameters_fail_construction() {
        let network = network();
        let obs = observation_at(&network, 0.0, 0.0);
        let mut params = FilterParameters::default();
        params.num_particles = 0;
        for kind in FilterKind::ALL {
            let result = kind.initialize(&obs, Arc::clone(&network), &params, 1);
            assert!(matches!(result, Err(FilterError::InvalidParameter { .. })));
        }
    }

    #[test]
    fn edge_velocities_are_weighted() {
        let mut velocities = EdgeVelocities::default();
        velocities.observe(EdgeId(3), 10.0, 1.0);
        velocities.observe(EdgeId(3), 20.0, 3.0);
        velocities.observe(EdgeId(3), f64::NAN, 3.0);
        assert_approx_eq!(velocities.mean(EdgeId(3)).unwrap(), 17.5, 1e-12);
        assert_approx_eq!(velocities.variance(EdgeId(3)).unwrap(), 18.75, 1e-12);
        assert_eq!(velocities.len(), 1);
        assert!(velocities.mean(EdgeId(4)).is_none());
    }
}
