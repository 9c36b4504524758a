//! Pipeline stage contracts
//!
//! The four stages of a geolocation run. Each stage consumes and
//! produces a slice of the shared `RunState`, wraps exactly one
//! external-collaborator concern, and owns the parsing/validation of
//! that collaborator's output. Stage order is strict; only the
//! orchestrator sequences them.
//!
//! Failure policy is uniform: a collaborator outage degrades the stage
//! (noted on the run state) and the run continues. The single
//! exception is Retrieval yielding nothing at all, which short-circuits
//! to a zero-confidence result.

pub mod hypothesis;
pub mod perception;
pub mod retrieval;
pub mod verification;

pub use hypothesis::HypothesisStage;
pub use perception::PerceptionStage;
pub use retrieval::RetrievalStage;
pub use verification::VerificationStage;
