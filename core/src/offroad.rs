//! Lineage-based reconstruction of off-road excursions.
//!
//! Resampling replaces every particle at every fix, so an excursion is only visible by
//! following a particle back through its parents. The tracker keeps, per particle of the
//! current generation, the list of excursions its lineage has made and derives the next
//! generation's lists from the parent's list:
//!
//! | parent   | child    | effect on the child's copy of the parent's list             |
//! |----------|----------|-------------------------------------------------------------|
//! | off-road | off-road | the open excursion gets the child's mean appended           |
//! | on-road  | off-road | a new excursion opens at the parent's edge                  |
//! | off-road | on-road  | the open excursion gets the child's mean and is closed      |
//! | on-road  | on-road  | carried over unchanged                                      |
//!
//! Lists are never modified in place; a new map is built and swapped in as a whole.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::GeoPoint;
use crate::earth::LocalProjection;
use crate::road::EdgeSummary;
use crate::state::{PosteriorDistribution, StateId, VehicleState};

/// One excursion away from the road network.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OffRoadPath {
    /// Edge the vehicle left from; `None` when it was never on a road
    pub start_edge: Option<EdgeSummary>,
    /// Edge the vehicle returned to; `None` while the excursion is open
    pub end_edge: Option<EdgeSummary>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub points_between: Vec<GeoPoint>,
}

impl OffRoadPath {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Excursion lists keyed by the particle they belong to.
pub type OffRoadPathMap = HashMap<StateId, Vec<OffRoadPath>>;

/// Derives the excursion lists of a new generation from the previous generation's lists.
#[derive(Clone, Copy, Debug)]
pub struct OffRoadPathTracker<'a> {
    projection: &'a LocalProjection,
}

impl<'a> OffRoadPathTracker<'a> {
    pub fn new(projection: &'a LocalProjection) -> Self {
        OffRoadPathTracker { projection }
    }

    /// Build the map for `posterior`. Parents are looked up in `prior`; particles without a
    /// parent there start with an empty list.
    pub fn track(
        &self,
        prior: Option<&PosteriorDistribution>,
        posterior: &PosteriorDistribution,
        previous: &OffRoadPathMap,
    ) -> OffRoadPathMap {
        posterior
            .states()
            .map(|state| {
                let parent = prior.and_then(|p| state.parent().and_then(|id| p.get(id)));
                (state.id(), self.extend(parent, state, previous))
            })
            .collect()
    }

    fn extend(
        &self,
        parent: Option<&VehicleState>,
        state: &VehicleState,
        previous: &OffRoadPathMap,
    ) -> Vec<OffRoadPath> {
        let Some(parent) = parent else {
            return Vec::new();
        };
        let mut paths = previous.get(&parent.id()).cloned().unwrap_or_default();
        let mean = self.projection.to_geo(&state.mean_location());
        let time = state.observation().timestamp;
        match (parent.is_off_road(), state.is_off_road()) {
            (true, true) => match paths.last_mut() {
                Some(open) if open.is_open() => open.points_between.push(mean),
                // lineage went off-road before tracking started
                _ => paths.push(OffRoadPath {
                    start_time: Some(time),
                    points_between: vec![mean],
                    ..OffRoadPath::default()
                }),
            },
            (false, true) => paths.push(OffRoadPath {
                start_edge: parent
                    .edge()
                    .map(|edge| EdgeSummary::from_edge(edge, self.projection)),
                start_time: Some(time),
                points_between: vec![mean],
                ..OffRoadPath::default()
            }),
            (true, false) => {
                if let Some(last) = paths.last_mut() {
                    last.points_between.push(mean);
                    last.end_edge = state
                        .edge()
                        .map(|edge| EdgeSummary::from_edge(edge, self.projection));
                    last.end_time = Some(time);
                }
            }
            (false, false) => {}
        }
        paths
    }
}
