//! Particles and the counted posterior distribution.
//!
//! Each generation of particles lives in its own [`PosteriorDistribution`], which doubles as
//! the arena for that generation: a particle names its parent by [`StateId`] and the parent is
//! looked up in the previous posterior. Identical children produced by resampling are stored
//! once with a multiplicity count.
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use nalgebra::Vector2;

use crate::Observation;
use crate::belief::{Belief, road_to_ground};
use crate::path::InferredPath;
use crate::road::RoadEdge;

/// Handle of a particle, unique within one inference instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u64);

impl Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic source of [`StateId`]s.
#[derive(Debug, Default)]
pub struct StateIdAllocator {
    next: u64,
}

impl StateIdAllocator {
    pub fn next_id(&mut self) -> StateId {
        let id = StateId(self.next);
        self.next += 1;
        id
    }
}

/// One particle: a belief, the path that produced it and the fix it was conditioned on.
#[derive(Clone, Debug)]
pub struct VehicleState {
    id: StateId,
    parent: Option<StateId>,
    belief: Belief,
    path: InferredPath,
    edge: Option<Arc<RoadEdge>>,
    observation: Arc<Observation>,
}

impl VehicleState {
    /// The current edge is the last edge of `path`; an empty path means off-road.
    pub fn new(
        id: StateId,
        parent: Option<StateId>,
        belief: Belief,
        path: InferredPath,
        observation: Arc<Observation>,
    ) -> Self {
        let edge = path.last_edge().cloned();
        VehicleState {
            id,
            parent,
            belief,
            path,
            edge,
            observation,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }
    pub fn parent(&self) -> Option<StateId> {
        self.parent
    }
    pub fn belief(&self) -> &Belief {
        &self.belief
    }
    pub fn path(&self) -> &InferredPath {
        &self.path
    }
    /// Current edge, `None` when off-road.
    pub fn edge(&self) -> Option<&Arc<RoadEdge>> {
        self.edge.as_ref()
    }
    pub fn observation(&self) -> &Arc<Observation> {
        &self.observation
    }
    pub fn is_off_road(&self) -> bool {
        self.edge.is_none()
    }

    /// The belief expressed in the ground regime.
    pub fn ground_belief(&self) -> Belief {
        match (&self.edge, self.belief.is_road()) {
            (Some(edge), true) => road_to_ground(&self.belief, edge),
            _ => self.belief.clone(),
        }
    }

    /// Mean location in local meters.
    pub fn mean_location(&self) -> Vector2<f64> {
        match (&self.edge, self.belief.is_road()) {
            (Some(edge), true) => edge.point_at(self.belief.mean()[0]).0,
            _ => self.belief.ground_position(),
        }
    }

    /// Signed along-edge speed of an on-road particle.
    pub fn along_edge_speed(&self) -> Option<f64> {
        match (&self.edge, self.belief.is_road()) {
            (Some(_), true) => Some(self.belief.mean()[1]),
            _ => None,
        }
    }
}

impl Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleState")
            .field("id", &self.id.0)
            .field("parent", &self.parent.map(|p| p.0))
            .field("edge", &self.edge.as_ref().map(|e| e.id().0))
            .field("mean", &self.belief.mean().as_slice())
            .finish()
    }
}

/// Distinct particles with multiplicity counts; the weight of an entry is `count / total`.
#[derive(Clone, Debug, Default)]
pub struct PosteriorDistribution {
    entries: Vec<(VehicleState, usize)>,
    index: HashMap<StateId, usize>,
    total: usize,
}

impl PosteriorDistribution {
    /// Entries with a zero count are dropped; repeated ids keep their first occurrence and
    /// accumulate the counts.
    pub fn new(entries: Vec<(VehicleState, usize)>) -> Self {
        let mut posterior = PosteriorDistribution::default();
        for (state, count) in entries {
            if count == 0 {
                continue;
            }
            posterior.total += count;
            match posterior.index.get(&state.id()) {
                Some(&i) => posterior.entries[i].1 += count,
                None => {
                    posterior.index.insert(state.id(), posterior.entries.len());
                    posterior.entries.push((state, count));
                }
            }
        }
        posterior
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Number of distinct particles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Sum of all multiplicities (the particle count).
    pub fn total_count(&self) -> usize {
        self.total
    }
    pub fn iter(&self) -> impl Iterator<Item = (&VehicleState, usize)> {
        self.entries.iter().map(|(s, c)| (s, *c))
    }
    pub fn states(&self) -> impl Iterator<Item = &VehicleState> {
        self.entries.iter().map(|(s, _)| s)
    }
    pub fn get(&self, id: StateId) -> Option<&VehicleState> {
        self.index.get(&id).map(|&i| &self.entries[i].0)
    }
    pub fn count_of(&self, id: StateId) -> usize {
        self.index.get(&id).map_or(0, |&i| self.entries[i].1)
    }
    pub fn weight_of(&self, id: StateId) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.count_of(id) as f64 / self.total as f64
        }
    }
    /// Normalized weights in entry order.
    pub fn weights(&self) -> Vec<f64> {
        let total = self.total.max(1) as f64;
        self.entries.iter().map(|(_, c)| *c as f64 / total).collect()
    }
    /// The particle with the largest multiplicity; the first one wins ties.
    pub fn max_weight_state(&self) -> Option<&VehicleState> {
        let mut best: Option<&(VehicleState, usize)> = None;
        for entry in &self.entries {
            if best.is_none_or(|b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(s, _)| s)
    }
    /// Weighted fraction of particles that are off-road.
    pub fn off_road_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let off: usize = self
            .entries
            .iter()
            .filter(|(s, _)| s.is_off_road())
            .map(|(_, c)| *c)
            .sum();
        off as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;
    use crate::road::EdgeId;
    use assert_approx_eq::assert_approx_eq;
    use chrono::{TimeZone, Utc};
    use nalgebra::Matrix2;

    fn observation() -> Arc<Observation> {
        Arc::new(
            Observation::new(
                "veh",
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                GeoPoint::new(10.0, 120.0),
                1.0,
                0.0,
                3.0,
            )
            .unwrap(),
        )
    }

    fn off_road(id: u64) -> VehicleState {
        VehicleState::new(
            StateId(id),
            None,
            Belief::ground(Vector2::new(id as f64, 0.0), Vector2::zeros(), 1.0, 1.0),
            InferredPath::empty(),
            observation(),
        )
    }

    #[test]
    fn counts_define_weights() {
        let posterior =
            PosteriorDistribution::new(vec![(off_road(1), 3), (off_road(2), 0), (off_road(3), 7)]);
        assert_eq!(posterior.len(), 2);
        assert_eq!(posterior.total_count(), 10);
        assert!(posterior.get(StateId(2)).is_none());
        assert_approx_eq!(posterior.weight_of(StateId(3)), 0.7, 1e-12);
        assert_approx_eq!(posterior.weights().iter().sum::<f64>(), 1.0, 1e-12);
        assert_eq!(posterior.max_weight_state().unwrap().id(), StateId(3));
    }

    #[test]
    fn repeated_ids_accumulate() {
        let posterior = PosteriorDistribution::new(vec![(off_road(1), 2), (off_road(1), 3)]);
        assert_eq!(posterior.len(), 1);
        assert_eq!(posterior.count_of(StateId(1)), 5);
    }

    #[test]
    fn max_weight_ties_keep_first() {
        let posterior = PosteriorDistribution::new(vec![(off_road(4), 5), (off_road(2), 5)]);
        assert_eq!(posterior.max_weight_state().unwrap().id(), StateId(4));
        assert!(PosteriorDistribution::default().max_weight_state().is_none());
    }

    #[test]
    fn on_road_state_reports_edge_location() {
        let edge = Arc::new(
            RoadEdge::new(
                EdgeId(5),
                "",
                1,
                2,
                vec![Vector2::new(0.0, 0.0), Vector2::new(0.0, 50.0)],
            )
            .unwrap(),
        );
        let state = VehicleState::new(
            StateId(9),
            Some(StateId(1)),
            Belief::road(20.0, 4.0, Matrix2::identity()),
            InferredPath::single(edge, false),
            observation(),
        );
        assert!(!state.is_off_road());
        assert_eq!(state.edge().unwrap().id(), EdgeId(5));
        let location = state.mean_location();
        assert_approx_eq!(location.y, 20.0, 1e-12);
        assert_eq!(state.along_edge_speed(), Some(4.0));
        let ground = state.ground_belief();
        assert_approx_eq!(ground.mean()[3], 4.0, 1e-12);
        let posterior = PosteriorDistribution::new(vec![(state, 2), (off_road(1), 2)]);
        assert_approx_eq!(posterior.off_road_fraction(), 0.5, 1e-12);
    }

    #[test]
    fn allocator_is_monotonic() {
        let mut ids = StateIdAllocator::default();
        assert_eq!(ids.next_id(), StateId(0));
        assert_eq!(ids.next_id(), StateId(1));
    }
}
