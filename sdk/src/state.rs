//! Run state and entity types
//!
//! Every entity that flows through a geolocation run lives here: clues
//! extracted from the image, geographic hypotheses, concrete location
//! candidates, the append-only evidence ledger, and the final
//! prediction. `RunState` owns all of them and is threaded explicitly
//! through the four pipeline stages — there is no ambient global state,
//! and concurrent batch runs each own a separate `RunState`.
//!
//! All types serialize with serde; the full `RunState` is the result
//! document the CLI and HTTP surfaces expose un-transformed.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::GeoError;
use crate::geo::{haversine_m, is_valid_lat, is_valid_lon};

/// Identifier of a clue within one run's `ClueSet`.
///
/// Assigned sequentially at insertion; insertion order reflects
/// extraction priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClueId(pub u32);

/// Pixel-space bounding box of a clue within the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Where a metadata clue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    /// Embedded EXIF data
    Exif,
    /// The image file itself (name, modification time)
    File,
    /// Derived during the run (e.g. from another clue)
    Derived,
}

/// One atomic observation extracted from the image or its metadata.
///
/// Immutable once created; owned by the run's `ClueSet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clue {
    /// Identifier within the owning `ClueSet`
    pub id: ClueId,

    /// The observation payload
    #[serde(flatten)]
    pub kind: ClueKind,
}

/// Clue payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClueKind {
    /// Text read from the image (signage, storefronts, plates)
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        region: Option<BoundingBox>,
        confidence: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// Non-textual visual feature (architecture, vegetation, road markings)
    Visual {
        kind: String,
        value: String,
        confidence: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        region: Option<BoundingBox>,
    },

    /// Metadata observation (GPS tag, timestamp, device info)
    Metadata {
        key: String,
        value: String,
        source: MetadataSource,
    },
}

impl Clue {
    /// The clue's text content, if it carries any.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            ClueKind::Text { text, .. } => Some(text),
            ClueKind::Visual { value, .. } => Some(value),
            ClueKind::Metadata { .. } => None,
        }
    }

    /// Extraction confidence; metadata clues are exact (1.0).
    pub fn confidence(&self) -> f64 {
        match &self.kind {
            ClueKind::Text { confidence, .. } | ClueKind::Visual { confidence, .. } => *confidence,
            ClueKind::Metadata { .. } => 1.0,
        }
    }
}

/// Ordered collection of clues for one image.
///
/// Created during Perception; later iterations may only *add* clues,
/// never remove or mutate earlier ones. The `degraded` flag marks a
/// clue set produced without the vision collaborator (metadata-only
/// fallback) so downstream stages can lower confidence ceilings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClueSet {
    clues: Vec<Clue>,
    next_id: u32,
    degraded: bool,
}

impl ClueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a clue, assigning the next sequential id.
    ///
    /// Confidence values are validated here so malformed collaborator
    /// output never enters the shared state.
    pub fn push(&mut self, kind: ClueKind) -> Result<ClueId, GeoError> {
        if let ClueKind::Text { confidence, .. } | ClueKind::Visual { confidence, .. } = &kind {
            if !(0.0..=1.0).contains(confidence) || !confidence.is_finite() {
                return Err(GeoError::Validation(format!(
                    "clue confidence {confidence} out of [0,1]"
                )));
            }
        }
        let id = ClueId(self.next_id);
        self.next_id += 1;
        self.clues.push(Clue { id, kind });
        Ok(id)
    }

    pub fn get(&self, id: ClueId) -> Option<&Clue> {
        self.clues.iter().find(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Clue> {
        self.clues.iter()
    }

    /// All text-bearing clue contents, in extraction order.
    pub fn texts(&self) -> Vec<&str> {
        self.clues.iter().filter_map(|c| c.text()).collect()
    }

    pub fn len(&self) -> usize {
        self.clues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clues.is_empty()
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// A candidate geographic region with supporting rationale, prior to
/// concrete coordinates.
///
/// Confidence is relative support among sibling hypotheses from the
/// same stage call, not calibrated across calls. Hypotheses from all
/// iterations are retained for audit; `iteration` distinguishes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub iteration: u32,
    /// Free-text or structured place descriptor, e.g. "Japan/Tokyo"
    pub region: String,
    /// Derivation text
    pub rationale: String,
    pub supporting_clues: BTreeSet<ClueId>,
    pub conflicting_clues: BTreeSet<ClueId>,
    pub confidence: f64,
}

impl Hypothesis {
    pub fn validate(&self) -> Result<(), GeoError> {
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            return Err(GeoError::Validation(format!(
                "hypothesis '{}' confidence {} out of [0,1]",
                self.region, self.confidence
            )));
        }
        if self.region.trim().is_empty() {
            return Err(GeoError::Validation("hypothesis region is empty".into()));
        }
        Ok(())
    }
}

/// Sort hypotheses descending by confidence.
///
/// Ties on confidence prefer the hypothesis whose supporting-clue set
/// is a strict superset of the other's (more corroborated); remaining
/// ties fall back to supporting-set size, then id, for determinism.
pub fn sort_hypotheses(hypotheses: &mut [Hypothesis]) {
    hypotheses.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_super = a.supporting_clues.is_superset(&b.supporting_clues)
                    && a.supporting_clues != b.supporting_clues;
                let b_super = b.supporting_clues.is_superset(&a.supporting_clues)
                    && a.supporting_clues != b.supporting_clues;
                match (a_super, b_super) {
                    (true, false) => std::cmp::Ordering::Less,
                    (false, true) => std::cmp::Ordering::Greater,
                    _ => b
                        .supporting_clues
                        .len()
                        .cmp(&a.supporting_clues.len())
                        .then_with(|| a.id.cmp(&b.id)),
                }
            })
    });
}

/// Sourcing path that produced (or corroborated) a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Embedding-based geographic retrieval
    Retrieval,
    /// Forward geocoding of a hypothesis region
    Geocode,
    /// POI search
    Poi,
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retrieval => write!(f, "retrieval"),
            Self::Geocode => write!(f, "geocode"),
            Self::Poi => write!(f, "poi"),
        }
    }
}

/// A concrete, scorable location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Provenance; deduplication unions these
    pub sources: BTreeSet<CandidateSource>,
    /// Score from the sourcing path, in [0,1]
    pub raw_score: f64,
    /// Score after evidence fusion; set during Verification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fused_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Candidate {
    /// Construct a validated candidate.
    pub fn new(
        name: impl Into<String>,
        lat: f64,
        lon: f64,
        source: CandidateSource,
        raw_score: f64,
    ) -> Result<Self, GeoError> {
        if !is_valid_lat(lat) || !is_valid_lon(lon) {
            return Err(GeoError::Validation(format!(
                "candidate coordinates ({lat}, {lon}) out of range"
            )));
        }
        if !(0.0..=1.0).contains(&raw_score) || !raw_score.is_finite() {
            return Err(GeoError::Validation(format!(
                "candidate raw_score {raw_score} out of [0,1]"
            )));
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            lat,
            lon,
            sources: BTreeSet::from([source]),
            raw_score,
            fused_score: None,
            address: None,
        })
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// The score Verification ranks by: fused if computed, raw otherwise.
    pub fn score(&self) -> f64 {
        self.fused_score.unwrap_or(self.raw_score)
    }

    /// Distance to another candidate in meters.
    pub fn distance_m(&self, other: &Candidate) -> f64 {
        haversine_m(self.lat, self.lon, other.lat, other.lon)
    }

    /// Absorb `other` into this candidate (spatial dedup).
    ///
    /// Keeps the max raw score, unions provenance, and takes the
    /// higher-scored side's name/address/coordinates. The surviving id
    /// is this candidate's, so evidence recorded earlier stays
    /// resolvable. Merging the same candidate twice is a no-op.
    pub fn merge(&mut self, other: &Candidate) {
        if other.raw_score > self.raw_score {
            self.name = other.name.clone();
            self.lat = other.lat;
            self.lon = other.lon;
            self.raw_score = other.raw_score;
            if other.address.is_some() {
                self.address = other.address.clone();
            }
        } else if self.address.is_none() {
            self.address = other.address.clone();
        }
        self.sources.extend(other.sources.iter().copied());
        // Fusion must be recomputed after any merge
        self.fused_score = None;
    }
}

/// The kind of check an evidence record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Clue text vs candidate name/address/POI names
    TextMatch,
    /// Script/language of clue text vs candidate region
    LanguagePrior,
    /// Road/POI layout vs visual clues
    Topology,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextMatch => write!(f, "text_match"),
            Self::LanguagePrior => write!(f, "language_prior"),
            Self::Topology => write!(f, "topology"),
        }
    }
}

/// Outcome of one evidence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceResult {
    Support,
    Contradict,
    Neutral,
}

/// Output of one evidence checker against one candidate.
///
/// Append-only once recorded; the evidence ledger is the audit trail
/// backing every claim in the final prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub candidate: String,
    pub check: CheckKind,
    pub result: EvidenceResult,
    /// Contribution to the fused score, in [-1,1]
    pub score_delta: f64,
    pub detail: String,
}

impl Evidence {
    /// Construct a validated evidence record.
    ///
    /// The delta's sign must agree with the result: support is
    /// non-negative, contradict non-positive, neutral exactly zero.
    pub fn new(
        candidate: impl Into<String>,
        check: CheckKind,
        result: EvidenceResult,
        score_delta: f64,
        detail: impl Into<String>,
    ) -> Result<Self, GeoError> {
        if !(-1.0..=1.0).contains(&score_delta) || !score_delta.is_finite() {
            return Err(GeoError::Validation(format!(
                "evidence score_delta {score_delta} out of [-1,1]"
            )));
        }
        let sign_ok = match result {
            EvidenceResult::Support => score_delta >= 0.0,
            EvidenceResult::Contradict => score_delta <= 0.0,
            EvidenceResult::Neutral => score_delta == 0.0,
        };
        if !sign_ok {
            return Err(GeoError::Validation(format!(
                "evidence delta {score_delta} inconsistent with {result:?} result"
            )));
        }
        Ok(Self {
            candidate: candidate.into(),
            check,
            result,
            score_delta,
            detail: detail.into(),
        })
    }
}

/// A lower-ranked candidate surfaced alongside the prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionAlternative {
    pub candidate: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub fused_score: f64,
}

/// The final, derived result of a run.
///
/// Computed exactly once, when the orchestrator's termination
/// predicate is satisfied. Every claim traces back to the evidence
/// ledger via `supporting_evidence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub candidate: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub supporting_evidence: Vec<Evidence>,
    /// Why the next-best candidates scored lower
    pub excluded: Vec<String>,
    pub alternatives: Vec<PredictionAlternative>,
    /// False when the iteration budget ran out before the threshold
    pub converged: bool,
}

/// Reference to the input image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Hex sha256 of the image bytes; keys the embedding cache
    pub content_hash: String,
}

/// The single owned, mutable record threading all entities through one
/// geolocation run.
///
/// Created at run start with only the input image reference, populated
/// incrementally by each stage, and read-only once a prediction is
/// attached or the iteration budget is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub image: ImageRef,
    pub clues: ClueSet,
    /// All iterations' hypotheses, retained for audit
    pub hypotheses: Vec<Hypothesis>,
    pub candidates: Vec<Candidate>,
    evidence: Vec<Evidence>,
    pub iteration: u32,
    /// Collaborators that degraded or failed during this run
    pub degraded: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(image: ImageRef) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            image,
            clues: ClueSet::new(),
            hypotheses: Vec::new(),
            candidates: Vec::new(),
            evidence: Vec::new(),
            iteration: 0,
            degraded: Vec::new(),
            prediction: None,
            started_at: Utc::now(),
        }
    }

    /// Append to the evidence ledger. There is deliberately no way to
    /// remove or mutate a recorded entry.
    pub fn add_evidence(&mut self, evidence: Evidence) {
        self.evidence.push(evidence);
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn evidence_for(&self, candidate_id: &str) -> Vec<&Evidence> {
        self.evidence
            .iter()
            .filter(|e| e.candidate == candidate_id)
            .collect()
    }

    /// Number of supporting (non-neutral, non-contradicting) evidence
    /// entries for a candidate; the ranking tie-breaker.
    pub fn supporting_count(&self, candidate_id: &str) -> usize {
        self.evidence
            .iter()
            .filter(|e| e.candidate == candidate_id && e.result == EvidenceResult::Support)
            .count()
    }

    pub fn best_candidate(&self) -> Option<&Candidate> {
        self.candidates.iter().max_by(|a, b| {
            a.score()
                .partial_cmp(&b.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.supporting_count(&a.id)
                        .cmp(&self.supporting_count(&b.id))
                })
        })
    }

    /// Hypotheses produced by the given iteration.
    pub fn hypotheses_for_iteration(&self, iteration: u32) -> Vec<&Hypothesis> {
        self.hypotheses
            .iter()
            .filter(|h| h.iteration == iteration)
            .collect()
    }

    pub fn note_degraded(&mut self, what: impl Into<String>) {
        let what = what.into();
        if !self.degraded.contains(&what) {
            self.degraded.push(what);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.prediction.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_clue(text: &str, confidence: f64) -> ClueKind {
        ClueKind::Text {
            text: text.to_string(),
            region: None,
            confidence,
            language: None,
        }
    }

    fn image_ref() -> ImageRef {
        ImageRef {
            path: None,
            content_hash: "deadbeef".to_string(),
        }
    }

    #[test]
    fn test_clueset_assigns_sequential_ids() {
        let mut clues = ClueSet::new();
        let a = clues.push(text_clue("Tokyo Station", 0.9)).unwrap();
        let b = clues.push(text_clue("Marunouchi", 0.7)).unwrap();
        assert_eq!(a, ClueId(0));
        assert_eq!(b, ClueId(1));
        assert_eq!(clues.len(), 2);
        assert_eq!(clues.get(a).unwrap().text(), Some("Tokyo Station"));
    }

    #[test]
    fn test_clueset_rejects_bad_confidence() {
        let mut clues = ClueSet::new();
        assert!(clues.push(text_clue("x", 1.5)).is_err());
        assert!(clues.push(text_clue("x", f64::NAN)).is_err());
        assert!(clues.is_empty());
    }

    #[test]
    fn test_candidate_coordinate_validation() {
        assert!(Candidate::new("ok", 48.85, 2.29, CandidateSource::Retrieval, 0.8).is_ok());
        assert!(Candidate::new("bad lat", 91.0, 0.0, CandidateSource::Retrieval, 0.8).is_err());
        assert!(Candidate::new("bad lon", 0.0, -181.0, CandidateSource::Geocode, 0.8).is_err());
        assert!(Candidate::new("bad score", 0.0, 0.0, CandidateSource::Poi, 1.2).is_err());
    }

    #[test]
    fn test_candidate_merge_keeps_max_score_and_unions_sources() {
        let mut a = Candidate::new("Eiffel Tower", 48.8584, 2.2945, CandidateSource::Retrieval, 0.6)
            .unwrap();
        let b = Candidate::new("Tour Eiffel", 48.8590, 2.2950, CandidateSource::Geocode, 0.8)
            .unwrap()
            .with_address("Champ de Mars, Paris");
        let a_id = a.id.clone();

        a.merge(&b);

        assert_eq!(a.id, a_id, "surviving id is stable across merges");
        assert_eq!(a.name, "Tour Eiffel");
        assert_eq!(a.raw_score, 0.8);
        assert!(a.sources.contains(&CandidateSource::Retrieval));
        assert!(a.sources.contains(&CandidateSource::Geocode));
        assert_eq!(a.address.as_deref(), Some("Champ de Mars, Paris"));
    }

    #[test]
    fn test_candidate_merge_is_idempotent() {
        let mut once = Candidate::new("A", 10.0, 10.0, CandidateSource::Retrieval, 0.5).unwrap();
        let other = Candidate::new("B", 10.001, 10.001, CandidateSource::Geocode, 0.7).unwrap();

        once.merge(&other);
        let mut twice = once.clone();
        twice.merge(&other);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_evidence_sign_consistency() {
        assert!(Evidence::new("c", CheckKind::TextMatch, EvidenceResult::Support, 0.3, "").is_ok());
        assert!(
            Evidence::new("c", CheckKind::TextMatch, EvidenceResult::Support, -0.1, "").is_err()
        );
        assert!(
            Evidence::new("c", CheckKind::LanguagePrior, EvidenceResult::Contradict, 0.1, "")
                .is_err()
        );
        assert!(Evidence::new("c", CheckKind::Topology, EvidenceResult::Neutral, 0.0, "").is_ok());
        assert!(Evidence::new("c", CheckKind::Topology, EvidenceResult::Neutral, 0.1, "").is_err());
    }

    #[test]
    fn test_hypothesis_sort_superset_tie_break() {
        let mut hypotheses = vec![
            Hypothesis {
                id: "h1".into(),
                iteration: 0,
                region: "France".into(),
                rationale: String::new(),
                supporting_clues: BTreeSet::from([ClueId(0)]),
                conflicting_clues: BTreeSet::new(),
                confidence: 0.7,
            },
            Hypothesis {
                id: "h2".into(),
                iteration: 0,
                region: "Paris, France".into(),
                rationale: String::new(),
                supporting_clues: BTreeSet::from([ClueId(0), ClueId(1)]),
                conflicting_clues: BTreeSet::new(),
                confidence: 0.7,
            },
            Hypothesis {
                id: "h3".into(),
                iteration: 0,
                region: "Belgium".into(),
                rationale: String::new(),
                supporting_clues: BTreeSet::new(),
                conflicting_clues: BTreeSet::new(),
                confidence: 0.9,
            },
        ];

        sort_hypotheses(&mut hypotheses);

        assert_eq!(hypotheses[0].id, "h3", "highest confidence first");
        assert_eq!(hypotheses[1].id, "h2", "superset wins the tie");
        assert_eq!(hypotheses[2].id, "h1");
    }

    #[test]
    fn test_evidence_ledger_is_append_only() {
        let mut state = RunState::new(image_ref());
        let before = state.evidence().len();
        state.add_evidence(
            Evidence::new("c1", CheckKind::TextMatch, EvidenceResult::Support, 0.2, "m").unwrap(),
        );
        state.add_evidence(
            Evidence::new("c1", CheckKind::Topology, EvidenceResult::Neutral, 0.0, "n").unwrap(),
        );
        assert_eq!(state.evidence().len(), before + 2);
        assert_eq!(state.supporting_count("c1"), 1);
        assert_eq!(state.evidence_for("c1").len(), 2);
    }

    #[test]
    fn test_best_candidate_prefers_fused_then_support() {
        let mut state = RunState::new(image_ref());
        let mut a = Candidate::new("A", 0.0, 0.0, CandidateSource::Retrieval, 0.9).unwrap();
        a.fused_score = Some(0.6);
        let mut b = Candidate::new("B", 1.0, 1.0, CandidateSource::Geocode, 0.3).unwrap();
        b.fused_score = Some(0.8);
        state.candidates = vec![a, b];

        assert_eq!(state.best_candidate().unwrap().name, "B");
    }
}
