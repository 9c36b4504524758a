//! Geocoding and POI search clients
//!
//! The symbolic sourcing path of the Retrieval stage and the POI
//! context provider for Verification. Both clients speak to
//! OpenStreetMap-ecosystem services (Nominatim for geocoding, Overpass
//! for POI/road queries) but only at their documented wire surface, so
//! any compatible self-hosted instance works.

use sdk::errors::GeoError;
use serde::{Deserialize, Serialize};

pub mod geocode;
pub mod poi;

pub use geocode::GeocodeClient;
pub use poi::PoiClient;

/// Result type for geo service operations
pub type Result<T> = std::result::Result<T, GeoToolError>;

/// Errors that can occur talking to geo services
#[derive(Debug, thiserror::Error)]
pub enum GeoToolError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("No match for: {0}")]
    NoMatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Timeout")]
    Timeout,
}

impl From<GeoToolError> for GeoError {
    fn from(err: GeoToolError) -> Self {
        match err {
            GeoToolError::Timeout => GeoError::CollaboratorTimeout("geo service".to_string()),
            GeoToolError::RateLimited => GeoError::RateLimited("geo service".to_string()),
            GeoToolError::NoMatch(q) => GeoError::NoMatch(q),
            GeoToolError::ParseError(msg) => GeoError::Parse(msg),
            GeoToolError::InvalidInput(msg) => GeoError::Validation(msg),
            GeoToolError::ServiceUnavailable(msg) => GeoError::CollaboratorUnavailable(msg),
        }
    }
}

/// A geocoding hit: a named place with coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceHit {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Service-reported importance, in [0,1]
    pub importance: f64,
}

/// A point of interest near a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}
