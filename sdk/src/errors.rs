//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Waypoint
//! engine. All errors implement the `WaypointErrorExt` trait which
//! provides user-friendly hints and indicates whether errors are
//! recoverable.
//!
//! Recoverable here means the run can continue on a degraded path: a
//! collaborator outage never aborts a run, it only lowers what the run
//! can claim. Only a broken input image (detected before Perception)
//! and configuration problems are fatal.

use thiserror::Error;

/// Trait for Waypoint error extensions
///
/// Provides additional context for errors: a hint safe to display to
/// end users and recoverability information. All engine errors
/// implement this trait.
pub trait WaypointErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the run can continue on a degraded path
    ///
    /// Recoverable errors trigger the owning stage's failure policy
    /// (degrade or bounded retry). Non-recoverable errors surface to
    /// the caller before or instead of a run.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// Each variant corresponds to one failure class of the geolocation
/// pipeline. Note that non-convergence (iteration budget exhausted
/// without meeting the confidence threshold) is *not* an error: it is
/// a normal terminal state flagged on the final prediction.
#[derive(Debug, Error)]
pub enum GeoError {
    // Collaborator failures (vision/language/retrieval/geo services)
    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Collaborator call timed out: {0}")]
    CollaboratorTimeout(String),

    #[error("Rate limited by {0}")]
    RateLimited(String),

    // Response handling
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No match for query: {0}")]
    NoMatch(String),

    // Pipeline outcomes
    #[error("Retrieval produced no candidates")]
    NoCandidates,

    // Input errors
    #[error("Invalid input image: {0}")]
    InvalidImage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WaypointErrorExt for GeoError {
    fn user_hint(&self) -> &str {
        match self {
            Self::CollaboratorUnavailable(_) => {
                "A model or geo service is unreachable. Check endpoints and network"
            }
            Self::CollaboratorTimeout(_) => "A model call took too long. Try again",
            Self::RateLimited(_) => "A geo service throttled us. Wait before retrying",
            Self::Parse(_) => "A collaborator returned malformed output",
            Self::Validation(_) => "A collaborator response violated the data model",
            Self::NoMatch(_) => "The geocoder found nothing for this query",
            Self::NoCandidates => "No location candidates could be retrieved for this image",
            Self::InvalidImage(_) => "The input image is corrupt or in an unsupported format",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Fatal: surfaced to the caller before Perception begins
            Self::InvalidImage(_) | Self::Config(_) => false,

            // Everything else degrades within the run
            _ => true,
        }
    }
}
