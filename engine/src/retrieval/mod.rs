//! Embedding-based geographic retrieval
//!
//! The embedding path of the Retrieval stage: an image is embedded and
//! compared against a precomputed geographic grid, yielding ranked
//! coordinate cells. The model and its index live behind an inference
//! endpoint; this module owns the boundary contract, the HTTP client,
//! and a shared result cache keyed by image content hash.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sdk::errors::GeoError;

use crate::media::ImageFile;

pub mod cache;
pub mod remote;

pub use cache::RetrievalCache;
pub use remote::RemoteGeoRetriever;

/// Result type for retrieval operations
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur during embedding retrieval
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Retrieval model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Geographic index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Timeout")]
    Timeout,
}

impl From<RetrievalError> for GeoError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::Timeout => {
                GeoError::CollaboratorTimeout("embedding retrieval".to_string())
            }
            RetrievalError::ParseError(msg) => GeoError::Parse(msg),
            other => GeoError::CollaboratorUnavailable(other.to_string()),
        }
    }
}

/// Geographic granularity of a retrieval pass.
///
/// The fine scale queries the full grid; coarser scales hedge against
/// a wrong fine-grained hypothesis by retrieving at city/region
/// resolution and unioning the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalScale {
    Fine,
    City,
    Region,
}

impl std::fmt::Display for RetrievalScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fine => write!(f, "fine"),
            Self::City => write!(f, "city"),
            Self::Region => write!(f, "region"),
        }
    }
}

/// One ranked cell from the geographic grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCell {
    pub lat: f64,
    pub lon: f64,
    /// Cosine similarity mapped into [0,1]
    pub score: f64,
}

/// Boundary contract of the embedding retrieval collaborator.
#[async_trait]
pub trait GeoRetriever: Send + Sync {
    fn name(&self) -> &str;

    async fn check_health(&self) -> bool {
        true
    }

    /// Top-K grid cells for the image at the given scale, best first.
    async fn retrieve(
        &self,
        image: &ImageFile,
        top_k: usize,
        scale: RetrievalScale,
    ) -> Result<Vec<GeoCell>>;
}
