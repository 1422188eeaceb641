use thiserror::Error;

use crate::geometry::ReachId;
use crate::pipeline::ReachStage;

#[derive(Debug, Error)]
pub enum ConflateError {
    #[error("no candidate features to search")]
    NoCandidate,

    #[error("nearest feature {id} is {distance:.1} units away, beyond the {threshold:.1} unit limit")]
    AmbiguousAssociation {
        id: ReachId,
        distance: f64,
        threshold: f64,
    },

    #[error("cycle detected in reference network at reach {0}")]
    CycleDetected(ReachId),

    #[error("station '{xs_id}' on reach {reach_id} is not numeric")]
    MalformedStation { reach_id: String, xs_id: String },

    #[error("missing layer: {0}")]
    MissingLayer(String),

    #[error("invalid geometry in {layer}: {reason}")]
    InvalidGeometry { layer: String, reason: String },

    #[error("feature in {layer} is missing property '{property}'")]
    MissingProperty { layer: String, property: String },

    #[error("source model CRS {source_crs} does not match reference CRS {reference_crs}")]
    CrsMismatch {
        reference_crs: String,
        source_crs: String,
    },

    #[error("increment step {0} must be a positive number")]
    InvalidStep(f64),

    #[error("reach id {0} does not fit the rating curve table")]
    ReachIdOutOfRange(ReachId),

    #[error("rating curve needs at least 2 distinct depths, found {0}")]
    DegenerateRatingCurve(usize),

    #[error("reach {reach_id}: cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        reach_id: ReachId,
        from: ReachStage,
        to: ReachStage,
    },

    #[error("reach {reach_id} not ready: {reason}")]
    NotReady { reach_id: ReachId, reason: String },

    #[error("solver failed: {0}")]
    Solver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    GeoJson(#[from] geojson::Error),
}

pub type Result<T> = std::result::Result<T, ConflateError>;
