//! Verification stage (includes finalization)
//!
//! Two clearly separated responsibilities in one component:
//!
//! 1. **Scoring** — for each candidate, prefetch its POI/road context,
//!    run the pure evidence checkers, append their records to the
//!    ledger, and re-rank by fused score. Per-candidate context
//!    fetches run concurrently; all of a candidate's evidence is
//!    recorded before its fused score is computed.
//! 2. **Prediction synthesis** — once the orchestrator decides to
//!    terminate, derive the final prediction from the top candidate:
//!    supporting evidence, exclusion reasons for the runners-up,
//!    alternatives above the score floor, and the reasoning text
//!    (holistic model pass with a templated fallback).
//!
//! The holistic pass only writes prose; the fused-score ranking is
//! ground truth and is never overridden by the model.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use sdk::errors::GeoError;
use sdk::state::{
    Candidate, EvidenceResult, Prediction, PredictionAlternative, RunState,
};

use crate::evidence::{rank_candidates, CheckContext, EvidenceCheck};
use crate::geo::{Poi, PoiClient};
use crate::llm::{Message, ModelRouter};

/// POI context radius around a candidate, meters
const CONTEXT_RADIUS_M: u32 = 500;

/// Runners-up explained in `excluded`
const EXCLUDED_LIMIT: usize = 3;

/// Ceiling applied to the prediction confidence when Perception ran
/// degraded (metadata-only clues)
const DEGRADED_CONFIDENCE_CEILING: f64 = 0.6;

/// Verification stage options derived from config.
#[derive(Debug, Clone)]
pub struct VerificationOptions {
    pub topology_check: bool,
    pub holistic_reasoning: bool,
    pub min_alternative_score: f64,
    pub confidence_threshold: f64,
}

pub struct VerificationStage {
    llm: Arc<ModelRouter>,
    poi: Arc<PoiClient>,
    checks: Vec<Box<dyn EvidenceCheck>>,
    options: VerificationOptions,
}

/// Prefetched network context for one candidate's checker runs.
struct CandidateContext {
    candidate_index: usize,
    nearby_pois: Vec<Poi>,
    roads: Option<Vec<String>>,
    fetch_failed: bool,
}

impl VerificationStage {
    pub fn new(
        llm: Arc<ModelRouter>,
        poi: Arc<PoiClient>,
        checks: Vec<Box<dyn EvidenceCheck>>,
        options: VerificationOptions,
    ) -> Self {
        Self {
            llm,
            poi,
            checks,
            options,
        }
    }

    /// Score all candidates: prefetch context, run checkers, append
    /// evidence, re-rank.
    pub async fn run(&self, state: &mut RunState) -> Result<(), GeoError> {
        info!(
            "Verification: iteration {}, {} candidates",
            state.iteration,
            state.candidates.len()
        );

        // Context fetches are independent across candidates
        let fetches = state
            .candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| self.fetch_context(index, candidate));
        let contexts: Vec<CandidateContext> = join_all(fetches).await;

        if contexts.iter().any(|c| c.fetch_failed) {
            state.note_degraded("poi search");
        }

        // Join point: every checker record for a candidate lands in
        // the ledger before rank_candidates computes fused scores
        let mut new_evidence = Vec::new();
        for context in &contexts {
            let candidate = &state.candidates[context.candidate_index];
            let ctx = CheckContext {
                clues: &state.clues,
                nearby_pois: &context.nearby_pois,
                roads: context.roads.as_deref(),
            };
            for check in &self.checks {
                if let Some(evidence) = check.run(candidate, &ctx) {
                    new_evidence.push(evidence);
                }
            }
        }
        let recorded = new_evidence.len();
        for evidence in new_evidence {
            state.add_evidence(evidence);
        }

        rank_candidates(state);
        info!(
            "Verification: recorded {recorded} evidence entries, top score {:.2}",
            state.candidates.first().map(|c| c.score()).unwrap_or(0.0)
        );
        Ok(())
    }

    async fn fetch_context(&self, index: usize, candidate: &Candidate) -> CandidateContext {
        let center = (candidate.lat, candidate.lon);

        let nearby = self.poi.nearby(center, CONTEXT_RADIUS_M);
        let roads = async {
            if self.options.topology_check {
                Some(self.poi.roads_near(center, CONTEXT_RADIUS_M).await)
            } else {
                None
            }
        };
        let (nearby, roads) = tokio::join!(nearby, roads);

        let mut fetch_failed = false;
        let nearby_pois = match nearby {
            Ok(pois) => pois,
            Err(e) => {
                warn!("Verification: POI context for '{}' failed: {e}", candidate.name);
                fetch_failed = true;
                Vec::new()
            }
        };
        let roads = match roads {
            Some(Ok(classes)) => Some(classes),
            Some(Err(e)) => {
                warn!("Verification: road context for '{}' failed: {e}", candidate.name);
                fetch_failed = true;
                None
            }
            None => None,
        };

        CandidateContext {
            candidate_index: index,
            nearby_pois,
            roads,
            fetch_failed,
        }
    }

    /// Synthesize the final prediction from the ranked candidates.
    ///
    /// `converged` is false when the iteration budget or the run
    /// deadline forced termination; the confidence is then capped at
    /// the threshold and the reasoning says so.
    pub async fn finalize(&self, state: &mut RunState, converged: bool) {
        let Some(top) = state.candidates.first().cloned() else {
            self.finalize_empty(state);
            return;
        };

        let supporting_evidence: Vec<_> = state
            .evidence_for(&top.id)
            .into_iter()
            .filter(|e| e.result == EvidenceResult::Support)
            .cloned()
            .collect();

        let excluded: Vec<String> = state
            .candidates
            .iter()
            .skip(1)
            .take(EXCLUDED_LIMIT)
            .map(|candidate| {
                let contradictions = state
                    .evidence_for(&candidate.id)
                    .iter()
                    .filter(|e| e.result == EvidenceResult::Contradict)
                    .count();
                let mut reason = format!(
                    "{}: scored {:.2} vs {:.2}",
                    candidate.name,
                    candidate.score(),
                    top.score()
                );
                if contradictions > 0 {
                    reason.push_str(&format!(" ({contradictions} contradicting checks)"));
                }
                reason
            })
            .collect();

        let alternatives: Vec<PredictionAlternative> = state
            .candidates
            .iter()
            .skip(1)
            .filter(|c| c.score() >= self.options.min_alternative_score)
            .map(|c| PredictionAlternative {
                candidate: c.id.clone(),
                name: c.name.clone(),
                lat: c.lat,
                lon: c.lon,
                fused_score: c.score(),
            })
            .collect();

        let mut confidence = top.score();
        if !converged {
            confidence = confidence.min(self.options.confidence_threshold);
        }
        if state.clues.is_degraded() {
            confidence = confidence.min(DEGRADED_CONFIDENCE_CEILING);
        }

        let reasoning = self.build_reasoning(state, &top, converged).await;

        state.prediction = Some(Prediction {
            candidate: top.id.clone(),
            name: top.name.clone(),
            lat: top.lat,
            lon: top.lon,
            confidence,
            reasoning,
            supporting_evidence,
            excluded,
            alternatives,
            converged,
        });
        info!(
            "Finalized: {} ({:.4}, {:.4}) confidence {:.2}, converged {}",
            top.name, top.lat, top.lon, confidence, converged
        );
    }

    /// Terminal result when retrieval produced nothing at all.
    pub fn finalize_empty(&self, state: &mut RunState) {
        let mut reasoning =
            "No location candidates could be retrieved for this image.".to_string();
        if !state.degraded.is_empty() {
            reasoning.push_str(&format!(
                " Degraded collaborators: {}.",
                state.degraded.join(", ")
            ));
        }
        state.prediction = Some(Prediction {
            candidate: String::new(),
            name: "unknown".to_string(),
            lat: 0.0,
            lon: 0.0,
            confidence: 0.0,
            reasoning,
            supporting_evidence: Vec::new(),
            excluded: Vec::new(),
            alternatives: Vec::new(),
            converged: false,
        });
    }

    /// Reasoning text: holistic model pass when enabled, templated
    /// fallback otherwise. The model only explains; it cannot change
    /// the ranking.
    async fn build_reasoning(
        &self,
        state: &RunState,
        top: &Candidate,
        converged: bool,
    ) -> String {
        if self.options.holistic_reasoning {
            let prompt = holistic_prompt(state, top);
            let messages = [
                Message::system(
                    "You are a geolocation analyst writing the final explanation of a \
                     prediction. Summarize, in a short paragraph, why the top candidate fits \
                     the evidence and why the alternatives were excluded. Base every claim \
                     strictly on the evidence provided. Output plain text only.",
                ),
                Message::user(prompt),
            ];
            match self.llm.call(&messages).await {
                Ok((text, _)) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        return decorate_reasoning(text.to_string(), state, converged);
                    }
                }
                Err(e) => warn!("Holistic reasoning degraded to template: {e}"),
            }
        }
        decorate_reasoning(template_reasoning(state, top), state, converged)
    }
}

/// Append degradation and convergence notes that must survive even a
/// model-written reasoning text.
fn decorate_reasoning(mut reasoning: String, state: &RunState, converged: bool) -> String {
    if !converged {
        reasoning.push_str(
            " [did not converge: iteration budget or deadline reached before the confidence \
             threshold]",
        );
    }
    if !state.degraded.is_empty() {
        reasoning.push_str(&format!(
            " [degraded collaborators: {}]",
            state.degraded.join(", ")
        ));
    }
    reasoning
}

fn template_reasoning(state: &RunState, top: &Candidate) -> String {
    let supporting = state.supporting_count(&top.id);
    format!(
        "Perception extracted {} clues; {} hypotheses were proposed over {} iteration(s); \
         retrieval produced {} candidates. {} ranked first with fused score {:.2} backed by \
         {} supporting evidence entries.",
        state.clues.len(),
        state.hypotheses.len(),
        state.iteration + 1,
        state.candidates.len(),
        top.name,
        top.score(),
        supporting,
    )
}

fn holistic_prompt(state: &RunState, top: &Candidate) -> String {
    let mut lines = vec!["Ranked candidates with their evidence:".to_string()];
    for candidate in state.candidates.iter().take(5) {
        lines.push(format!(
            "- {} ({:.4}, {:.4}) fused score {:.2}{}",
            candidate.name,
            candidate.lat,
            candidate.lon,
            candidate.score(),
            if candidate.id == top.id { "  <- top" } else { "" }
        ));
        for evidence in state.evidence_for(&candidate.id) {
            lines.push(format!(
                "    [{:?}] {}: {}",
                evidence.result, evidence.check, evidence.detail
            ));
        }
    }
    lines.join("\n")
}
