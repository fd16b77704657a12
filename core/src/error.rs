//! Error types for observation intake, filter construction and instance updates.
//!
//! Conditions the admission gate handles on its own (stale fixes, excessive gaps,
//! disabled or unknown vehicles) are not errors; they are reported through
//! [`crate::instance::UpdateOutcome`].

use thiserror::Error;

/// A location record that cannot be turned into an [`crate::Observation`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("expected 6 comma-separated fields, found {0}")]
    FieldCount(usize),

    #[error("invalid timestamp '{0}' (expected yyyyMMddTHHmmss)")]
    Timestamp(String),

    #[error("invalid {field} value '{value}'")]
    Number { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("vehicle id must not be empty")]
    EmptyVehicleId,

    #[error("batch contains no records")]
    EmptyBatch,

    #[error("record {line}: {source}")]
    InvalidRecord {
        line: usize,
        #[source]
        source: Box<ObservationError>,
    },
}

/// Reasons a filter cannot be built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("unknown filter type '{0}'")]
    UnknownKind(String),

    #[error("invalid filter parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Errors surfaced by [`crate::instance::InferenceInstance`] and
/// [`crate::registry::InstanceRegistry`].
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error("filter construction failed for vehicle {vehicle_id}: {source}")]
    FilterConstruction {
        vehicle_id: String,
        #[source]
        source: FilterError,
    },

    #[error("inference state for vehicle {0} is poisoned")]
    Poisoned(String),
}

/// Problems found while building a road network.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NetworkError {
    #[error("edge {0} needs at least two distinct vertices")]
    DegenerateEdge(u32),

    #[error("edge {0} is defined more than once")]
    DuplicateEdge(u32),
}

/// Problems with a synthetic drive request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("route contains no edges")]
    EmptyRoute,

    #[error("invalid drive parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error(transparent)]
    Observation(#[from] ObservationError),
}
