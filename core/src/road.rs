//! Road network contract and an in-memory reference implementation
//!
//! The inference engine only ever reads the road network. It needs four things from it: the
//! projection that maps fixes into the local metric frame, the edges near a location, a
//! connecting path between two locations, and edge geometry/name lookups by id. Anything that
//! can answer those (a tile service, a database, a test fixture) implements [`RoadNetwork`].
//!
//! [`InMemoryRoadNetwork`] holds polyline edges in local meters and answers path queries with
//! A* over an edge-adjacency graph: every road edge is a graph node and two edges are
//! connected when they share an intersection. Roads are treated as two-way.
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use nalgebra::Vector2;
use petgraph::algo::astar;
use petgraph::graphmap::UnGraphMap;
use serde::{Deserialize, Serialize};

use crate::GeoPoint;
use crate::earth::LocalProjection;
use crate::error::NetworkError;

/// Identifier of a road edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub u32);

impl Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed polyline between two intersections, in local `[east, north]` meters.
///
/// Distances along the edge are measured from the first geometry vertex.
#[derive(Clone, Debug, PartialEq)]
pub struct RoadEdge {
    id: EdgeId,
    name: String,
    from_node: u64,
    to_node: u64,
    geometry: Vec<Vector2<f64>>,
    cumulative: Vec<f64>,
}

/// Orthogonal projection of a location onto an edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeProjection {
    /// Distance along the edge of the closest point, in [0, length]
    pub distance_along: f64,
    /// The closest point on the edge
    pub point: Vector2<f64>,
    /// Unit direction of the edge at the closest point
    pub tangent: Vector2<f64>,
    /// Distance from the location to the closest point
    pub offset: f64,
}

impl RoadEdge {
    pub fn new(
        id: EdgeId,
        name: impl Into<String>,
        from_node: u64,
        to_node: u64,
        geometry: Vec<Vector2<f64>>,
    ) -> Result<Self, NetworkError> {
        let mut cumulative = Vec::with_capacity(geometry.len());
        let mut total = 0.0;
        for (i, vertex) in geometry.iter().enumerate() {
            if i > 0 {
                total += (vertex - geometry[i - 1]).norm();
            }
            cumulative.push(total);
        }
        if geometry.len() < 2 || total <= 0.0 || !total.is_finite() {
            return Err(NetworkError::DegenerateEdge(id.0));
        }
        Ok(RoadEdge {
            id,
            name: name.into(),
            from_node,
            to_node,
            geometry,
            cumulative,
        })
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn from_node(&self) -> u64 {
        self.from_node
    }
    pub fn to_node(&self) -> u64 {
        self.to_node
    }
    pub fn geometry(&self) -> &[Vector2<f64>] {
        &self.geometry
    }
    pub fn length(&self) -> f64 {
        self.cumulative[self.cumulative.len() - 1]
    }
    pub fn midpoint(&self) -> Vector2<f64> {
        self.point_at(0.5 * self.length()).0
    }

    /// Location and unit tangent at `distance` along the edge.
    ///
    /// Distances outside `[0, length]` extrapolate along the first or last segment, so a
    /// Gaussian over the along-edge distance maps linearly onto the plane near the ends.
    pub fn point_at(&self, distance: f64) -> (Vector2<f64>, Vector2<f64>) {
        let last = self.geometry.len() - 2;
        let segment = self
            .cumulative
            .windows(2)
            .position(|w| distance < w[1])
            .unwrap_or(last);
        let start = self.geometry[segment];
        let delta = self.geometry[segment + 1] - start;
        let seg_len = delta.norm();
        let tangent = if seg_len > 0.0 {
            delta / seg_len
        } else {
            Vector2::new(1.0, 0.0)
        };
        (start + tangent * (distance - self.cumulative[segment]), tangent)
    }

    /// Closest point on the edge to `location`.
    pub fn project(&self, location: &Vector2<f64>) -> EdgeProjection {
        let mut best: Option<EdgeProjection> = None;
        for (i, w) in self.geometry.windows(2).enumerate() {
            let delta = w[1] - w[0];
            let seg_len_sq = delta.norm_squared();
            if seg_len_sq <= 0.0 {
                continue;
            }
            let seg_len = seg_len_sq.sqrt();
            let t = ((location - w[0]).dot(&delta) / seg_len_sq).clamp(0.0, 1.0);
            let point = w[0] + delta * t;
            let offset = (location - point).norm();
            if best.as_ref().is_none_or(|b| offset < b.offset) {
                best = Some(EdgeProjection {
                    distance_along: self.cumulative[i] + t * seg_len,
                    point,
                    tangent: delta / seg_len,
                    offset,
                });
            }
        }
        // a valid edge always has at least one non-degenerate segment
        best.unwrap_or(EdgeProjection {
            distance_along: 0.0,
            point: self.geometry[0],
            tangent: Vector2::new(1.0, 0.0),
            offset: (location - self.geometry[0]).norm(),
        })
    }

    fn shares_node_with(&self, other: &RoadEdge) -> bool {
        self.from_node == other.from_node
            || self.from_node == other.to_node
            || self.to_node == other.from_node
            || self.to_node == other.to_node
    }
}

/// Reportable description of a road edge: id, name and WGS84 geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub id: EdgeId,
    pub name: String,
    pub geometry: Vec<GeoPoint>,
}

impl EdgeSummary {
    pub fn from_edge(edge: &RoadEdge, projection: &LocalProjection) -> Self {
        EdgeSummary {
            id: edge.id(),
            name: edge.name().to_string(),
            geometry: edge.geometry().iter().map(|v| projection.to_geo(v)).collect(),
        }
    }
}

/// Read-only road network used by the filters.
///
/// Implementations must be safe to query from many vehicles at once.
pub trait RoadNetwork: Send + Sync {
    /// Projection between WGS84 and the local frame the edge geometry is expressed in.
    fn projection(&self) -> &LocalProjection;

    /// Edges whose closest point lies within `radius` meters of `location`, nearest first
    /// (ties broken by edge id).
    fn nearest_edges(&self, location: &Vector2<f64>, radius: f64) -> Vec<Arc<RoadEdge>>;

    /// Ordered edges of a minimum-cost path from the edge nearest `from` to the edge nearest
    /// `to`. Empty when either end has no edge or the two are not connected.
    fn connecting_path(&self, from: &Vector2<f64>, to: &Vector2<f64>) -> Vec<Arc<RoadEdge>>;

    /// Edge lookup by id.
    fn edge_info(&self, id: EdgeId) -> Option<Arc<RoadEdge>>;
}

/// On-disk description of a road network: a projection origin plus WGS84 edge polylines.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoadNetworkFile {
    pub origin: GeoPoint,
    pub edges: Vec<RoadEdgeRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoadEdgeRecord {
    pub id: EdgeId,
    #[serde(default)]
    pub name: String,
    pub from_node: u64,
    pub to_node: u64,
    pub geometry: Vec<GeoPoint>,
}

/// Road network held entirely in memory.
#[derive(Clone, Debug)]
pub struct InMemoryRoadNetwork {
    projection: LocalProjection,
    edges: BTreeMap<EdgeId, Arc<RoadEdge>>,
    adjacency: UnGraphMap<u32, f64>,
}

impl InMemoryRoadNetwork {
    pub fn new(projection: LocalProjection, edges: Vec<RoadEdge>) -> Result<Self, NetworkError> {
        let mut by_id = BTreeMap::new();
        for edge in edges {
            let id = edge.id();
            if by_id.insert(id, Arc::new(edge)).is_some() {
                return Err(NetworkError::DuplicateEdge(id.0));
            }
        }
        let mut by_node: HashMap<u64, Vec<EdgeId>> = HashMap::new();
        let mut adjacency = UnGraphMap::new();
        for edge in by_id.values() {
            adjacency.add_node(edge.id().0);
            by_node.entry(edge.from_node()).or_default().push(edge.id());
            if edge.to_node() != edge.from_node() {
                by_node.entry(edge.to_node()).or_default().push(edge.id());
            }
        }
        for incident in by_node.values() {
            for (i, a) in incident.iter().enumerate() {
                for b in &incident[i + 1..] {
                    // midpoint-to-midpoint travel cost
                    let cost = 0.5 * (by_id[a].length() + by_id[b].length());
                    adjacency.add_edge(a.0, b.0, cost);
                }
            }
        }
        debug!(
            "Built road network with {} edges and {} connections",
            adjacency.node_count(),
            adjacency.edge_count()
        );
        Ok(InMemoryRoadNetwork {
            projection,
            edges: by_id,
            adjacency,
        })
    }

    /// Build from WGS84 edge records, projecting them about the file's origin.
    pub fn from_records(file: RoadNetworkFile) -> Result<Self, NetworkError> {
        let projection = LocalProjection::new(file.origin);
        let edges = file
            .edges
            .into_iter()
            .map(|record| {
                let geometry = record
                    .geometry
                    .iter()
                    .map(|p| projection.to_local(p))
                    .collect();
                RoadEdge::new(
                    record.id,
                    record.name,
                    record.from_node,
                    record.to_node,
                    geometry,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        InMemoryRoadNetwork::new(projection, edges)
    }

    /// Read a [`RoadNetworkFile`] from JSON.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let records: RoadNetworkFile = serde_json::from_reader(file).map_err(io::Error::other)?;
        InMemoryRoadNetwork::from_records(records).map_err(io::Error::other)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Arc<RoadEdge>> {
        self.edges.values()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn nearest_edge(&self, location: &Vector2<f64>) -> Option<Arc<RoadEdge>> {
        self.edges
            .values()
            .map(|edge| (edge.project(location).offset, edge))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id().cmp(&b.1.id())))
            .map(|(_, edge)| Arc::clone(edge))
    }
}

impl RoadNetwork for InMemoryRoadNetwork {
    fn projection(&self) -> &LocalProjection {
        &self.projection
    }

    fn nearest_edges(&self, location: &Vector2<f64>, radius: f64) -> Vec<Arc<RoadEdge>> {
        let mut found: Vec<(f64, &Arc<RoadEdge>)> = self
            .edges
            .values()
            .map(|edge| (edge.project(location).offset, edge))
            .filter(|(offset, _)| *offset <= radius)
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id().cmp(&b.1.id())));
        found.into_iter().map(|(_, edge)| Arc::clone(edge)).collect()
    }

    fn connecting_path(&self, from: &Vector2<f64>, to: &Vector2<f64>) -> Vec<Arc<RoadEdge>> {
        let (Some(start), Some(goal)) = (self.nearest_edge(from), self.nearest_edge(to)) else {
            return Vec::new();
        };
        if start.id() == goal.id() {
            return vec![start];
        }
        let goal_mid = goal.midpoint();
        let found = astar(
            &self.adjacency,
            start.id().0,
            |node| node == goal.id().0,
            |(_, _, cost)| *cost,
            |node| {
                self.edges
                    .get(&EdgeId(node))
                    .map(|edge| (edge.midpoint() - goal_mid).norm())
                    .unwrap_or(0.0)
            },
        );
        match found {
            Some((_, nodes)) => nodes
                .into_iter()
                .filter_map(|node| self.edges.get(&EdgeId(node)).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    fn edge_info(&self, id: EdgeId) -> Option<Arc<RoadEdge>> {
        self.edges.get(&id).cloned()
    }
}
