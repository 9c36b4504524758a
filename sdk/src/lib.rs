//! Waypoint SDK
//!
//! Shared library providing the typed geolocation data model and error
//! taxonomy for Waypoint components. This crate is used by the engine
//! and by any outer surface (CLI, HTTP) that exposes run results.

/// Error types and handling
pub mod errors;

/// Geodesic helpers
pub mod geo;

/// Run state and entity types
pub mod state;

// Re-export commonly used types
pub use errors::{GeoError, WaypointErrorExt};
pub use state::{
    BoundingBox, Candidate, CandidateSource, CheckKind, Clue, ClueId, ClueKind, ClueSet, Evidence,
    EvidenceResult, Hypothesis, ImageRef, MetadataSource, Prediction, PredictionAlternative,
    RunState,
};
