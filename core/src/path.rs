//! Inferred paths over the road network.
//!
//! A path is the ordered list of edges a particle traversed between its parent's location and
//! its own. The empty path marks a particle that is off-road.
use std::sync::Arc;

use crate::road::{EdgeId, RoadEdge};

/// One edge of an [`InferredPath`] together with the path distance at which it starts.
#[derive(Clone, Debug, PartialEq)]
pub struct PathEdge {
    edge: Arc<RoadEdge>,
    distance_to_start: f64,
}

impl PathEdge {
    pub fn edge(&self) -> &Arc<RoadEdge> {
        &self.edge
    }
    pub fn distance_to_start(&self) -> f64 {
        self.distance_to_start
    }
}

/// Ordered road edges with a signed total length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferredPath {
    edges: Vec<PathEdge>,
    total_distance: Option<f64>,
    is_backward: bool,
}

impl InferredPath {
    /// The off-road path.
    pub fn empty() -> Self {
        InferredPath::default()
    }

    /// Build a path from consecutive edges. Backward paths report a negative total distance.
    pub fn from_edges(edges: Vec<Arc<RoadEdge>>, is_backward: bool) -> Self {
        if edges.is_empty() {
            return InferredPath::empty();
        }
        let mut distance = 0.0;
        let edges: Vec<PathEdge> = edges
            .into_iter()
            .map(|edge| {
                let path_edge = PathEdge {
                    distance_to_start: distance,
                    edge,
                };
                distance += path_edge.edge.length();
                path_edge
            })
            .collect();
        let sign = if is_backward { -1.0 } else { 1.0 };
        InferredPath {
            edges,
            total_distance: Some(sign * distance),
            is_backward,
        }
    }

    /// Single-edge path.
    pub fn single(edge: Arc<RoadEdge>, is_backward: bool) -> Self {
        InferredPath::from_edges(vec![edge], is_backward)
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
    pub fn edges(&self) -> &[PathEdge] {
        &self.edges
    }
    /// Signed length of the path, `None` for the empty path.
    pub fn total_distance(&self) -> Option<f64> {
        self.total_distance
    }
    pub fn is_backward(&self) -> bool {
        self.is_backward
    }
    pub fn last_edge(&self) -> Option<&Arc<RoadEdge>> {
        self.edges.last().map(|e| &e.edge)
    }
    pub fn edge_ids(&self) -> Vec<EdgeId> {
        self.edges.iter().map(|e| e.edge.id()).collect()
    }
    /// `+1.0` or `-1.0` according to the sign of the total distance, `None` when off-road.
    pub fn direction(&self) -> Option<f64> {
        self.total_distance
            .map(|d| if d > 0.0 { 1.0 } else { -1.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector2;

    fn edge(id: u32, length: f64) -> Arc<RoadEdge> {
        Arc::new(
            RoadEdge::new(
                EdgeId(id),
                "",
                id as u64,
                id as u64 + 1,
                vec![Vector2::new(0.0, 0.0), Vector2::new(length, 0.0)],
            )
            .unwrap(),
        )
    }

    #[test]
    fn empty_path_has_no_distance() {
        let path = InferredPath::empty();
        assert!(path.is_empty());
        assert_eq!(path.total_distance(), None);
        assert_eq!(path.direction(), None);
        assert!(path.last_edge().is_none());
    }

    #[test]
    fn forward_and_backward_distances() {
        let forward = InferredPath::from_edges(vec![edge(1, 30.0), edge(2, 12.5)], false);
        assert_approx_eq!(forward.total_distance().unwrap(), 42.5, 1e-12);
        assert_approx_eq!(forward.edges()[1].distance_to_start(), 30.0, 1e-12);
        assert_eq!(forward.direction(), Some(1.0));
        assert_eq!(forward.edge_ids(), vec![EdgeId(1), EdgeId(2)]);
        assert_eq!(forward.last_edge().unwrap().id(), EdgeId(2));

        let backward = InferredPath::single(edge(3, 10.0), true);
        assert_approx_eq!(backward.total_distance().unwrap(), -10.0, 1e-12);
        assert_eq!(backward.direction(), Some(-1.0));
        assert!(backward.is_backward());
    }
}
