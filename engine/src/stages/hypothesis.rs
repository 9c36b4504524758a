//! Hypothesis stage
//!
//! Turns the clue set into 2–5 ranked geographic hypotheses via the
//! chat collaborator. On re-entry (iteration ≥ 2) the stage conditions
//! on the full hypothesis history and the scored candidate/evidence
//! context so the model refines instead of repeating itself.
//!
//! A response with an empty hypothesis list or out-of-range confidence
//! is rejected and retried once with identical input; after that the
//! stage falls back to a single generic low-confidence hypothesis so
//! the run can continue.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use sdk::errors::GeoError;
use sdk::state::{sort_hypotheses, ClueId, ClueKind, Hypothesis, RunState};

use crate::llm::{extract_json_array, Message, ModelRouter};

const MAX_HYPOTHESES: usize = 5;

const HYPOTHESIS_SYSTEM_PROMPT: &str = "You are a geolocation analyst. Given clues extracted \
    from a photograph, propose 2-5 hypotheses about where it was taken.\n\
    Output ONLY a JSON array. Each element:\n\
    {\n\
      \"region\": \"Country/State/City or descriptive region\",\n\
      \"rationale\": \"why this region fits the clues\",\n\
      \"supporting_clue_ids\": [0, 2],\n\
      \"conflicting_clue_ids\": [],\n\
      \"confidence\": 0.0-1.0\n\
    }\n\
    Confidence expresses relative support among your hypotheses. Order \
    them best first. Output ONLY the JSON array, no markdown, no \
    explanation.";

/// Intermediate deserialization type for the model's JSON output
#[derive(Debug, Deserialize)]
struct RawHypothesis {
    region: String,
    #[serde(default)]
    rationale: RationaleText,
    #[serde(default)]
    supporting_clue_ids: Vec<u32>,
    #[serde(default)]
    conflicting_clue_ids: Vec<u32>,
    confidence: f64,
}

/// Models emit the rationale as either a string or a list of strings.
#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
enum RationaleText {
    #[default]
    Missing,
    One(String),
    Many(Vec<String>),
}

impl RationaleText {
    fn join(self) -> String {
        match self {
            Self::Missing => String::new(),
            Self::One(text) => text,
            Self::Many(parts) => parts.join("; "),
        }
    }
}

pub struct HypothesisStage {
    llm: Arc<ModelRouter>,
}

impl HypothesisStage {
    pub fn new(llm: Arc<ModelRouter>) -> Self {
        Self { llm }
    }

    /// Append this iteration's hypotheses to the run state.
    pub async fn run(&self, state: &mut RunState) -> Result<(), GeoError> {
        let iteration = state.iteration;
        info!("Hypothesis: iteration {iteration}, {} clues", state.clues.len());

        let user_prompt = build_prompt(state);
        let messages = [
            Message::system(HYPOTHESIS_SYSTEM_PROMPT),
            Message::user(user_prompt),
        ];

        // Reject-and-retry once on empty/invalid output, then degrade
        let mut accepted = None;
        for attempt in 0..2 {
            match self.llm.call(&messages).await {
                Ok((content, _provider)) => match parse_hypotheses(&content) {
                    Ok(raw) => {
                        accepted = Some(raw);
                        break;
                    }
                    Err(e) => warn!("Hypothesis: invalid response (attempt {attempt}): {e}"),
                },
                Err(e) => warn!("Hypothesis: model call failed (attempt {attempt}): {e}"),
            }
        }

        let mut hypotheses = match accepted {
            Some(raw) => self.convert(raw, state),
            None => {
                state.note_degraded("hypothesis model");
                vec![fallback_hypothesis(state)]
            }
        };

        sort_hypotheses(&mut hypotheses);
        for (index, hypothesis) in hypotheses.iter_mut().enumerate() {
            hypothesis.id = format!("h{iteration}-{index}");
            hypothesis.iteration = iteration;
        }

        info!(
            "Hypothesis: {} hypotheses, best region '{}'",
            hypotheses.len(),
            hypotheses.first().map(|h| h.region.as_str()).unwrap_or("-")
        );
        state.hypotheses.extend(hypotheses);
        Ok(())
    }

    /// Convert validated raw rows into typed hypotheses, resolving
    /// clue ids against the actual clue set.
    fn convert(&self, raw: Vec<RawHypothesis>, state: &RunState) -> Vec<Hypothesis> {
        raw.into_iter()
            .take(MAX_HYPOTHESES)
            .map(|r| {
                let resolve = |ids: Vec<u32>| -> BTreeSet<ClueId> {
                    ids.into_iter()
                        .map(ClueId)
                        .filter(|id| state.clues.get(*id).is_some())
                        .collect()
                };
                Hypothesis {
                    id: String::new(), // assigned after sorting
                    iteration: state.iteration,
                    region: r.region,
                    rationale: r.rationale.join(),
                    supporting_clues: resolve(r.supporting_clue_ids),
                    conflicting_clues: resolve(r.conflicting_clue_ids),
                    confidence: r.confidence,
                }
            })
            .collect()
    }
}

/// Parse and validate the model's hypothesis array.
///
/// Empty lists and out-of-range confidences reject the whole response
/// (the caller retries); anything structurally valid passes through.
fn parse_hypotheses(content: &str) -> Result<Vec<RawHypothesis>, GeoError> {
    let json_str = extract_json_array(content)
        .ok_or_else(|| GeoError::Parse("no JSON array in hypothesis output".to_string()))?;
    let raw: Vec<RawHypothesis> = serde_json::from_str(json_str)
        .map_err(|e| GeoError::Parse(format!("hypothesis output: {e}")))?;

    if raw.is_empty() {
        return Err(GeoError::Validation("empty hypothesis list".to_string()));
    }
    for hypothesis in &raw {
        if !(0.0..=1.0).contains(&hypothesis.confidence) || !hypothesis.confidence.is_finite() {
            return Err(GeoError::Validation(format!(
                "hypothesis confidence {} out of [0,1]",
                hypothesis.confidence
            )));
        }
        if hypothesis.region.trim().is_empty() {
            return Err(GeoError::Validation("hypothesis region is empty".to_string()));
        }
    }
    Ok(raw)
}

/// Readable clue summary with stable ids the model can reference.
fn summarize_clues(state: &RunState) -> String {
    if state.clues.is_empty() {
        return "(no clues could be extracted from the image)".to_string();
    }
    let mut lines = Vec::new();
    for clue in state.clues.iter() {
        let line = match &clue.kind {
            ClueKind::Text {
                text,
                confidence,
                language,
                ..
            } => {
                let lang = language.as_deref().unwrap_or("?");
                format!(
                    "  #{} text \"{}\" (confidence {:.2}, language {})",
                    clue.id.0, text, confidence, lang
                )
            }
            ClueKind::Visual {
                kind,
                value,
                confidence,
                ..
            } => format!(
                "  #{} visual {}: {} (confidence {:.2})",
                clue.id.0, kind, value, confidence
            ),
            ClueKind::Metadata { key, value, .. } => {
                format!("  #{} metadata {} = {}", clue.id.0, key, value)
            }
        };
        lines.push(line);
    }
    lines.join("\n")
}

/// Prior-iteration grounding: hypotheses already tried and how their
/// candidates scored, so the model avoids repeating rejected regions.
fn summarize_history(state: &RunState) -> String {
    let mut parts = Vec::new();

    if !state.hypotheses.is_empty() {
        let mut lines = vec!["Previously proposed hypotheses (do NOT repeat these):".to_string()];
        for hypothesis in &state.hypotheses {
            lines.push(format!(
                "  [iteration {}] {} (confidence {:.2})",
                hypothesis.iteration, hypothesis.region, hypothesis.confidence
            ));
        }
        parts.push(lines.join("\n"));
    }

    if !state.candidates.is_empty() {
        let mut lines =
            vec!["Candidates scored so far (low scores mean the region is unlikely):".to_string()];
        for candidate in state.candidates.iter().take(8) {
            let evidence_summary: Vec<String> = state
                .evidence_for(&candidate.id)
                .iter()
                .map(|e| format!("{}={:?}", e.check, e.result))
                .collect();
            lines.push(format!(
                "  {} ({:.4}, {:.4}) score {:.2} [{}]",
                candidate.name,
                candidate.lat,
                candidate.lon,
                candidate.score(),
                evidence_summary.join(", ")
            ));
        }
        parts.push(lines.join("\n"));
    }

    parts.join("\n\n")
}

fn build_prompt(state: &RunState) -> String {
    let clues = summarize_clues(state);
    if state.iteration == 0 {
        format!("Clues extracted from the image:\n{clues}")
    } else {
        format!(
            "Clues extracted from the image:\n{clues}\n\n{}\n\nPropose refined or alternative \
             hypotheses that better explain the clues.",
            summarize_history(state)
        )
    }
}

/// Degraded-path hypothesis when the model is unavailable or keeps
/// returning invalid output. Anchors on the EXIF geotag when present.
fn fallback_hypothesis(state: &RunState) -> Hypothesis {
    let gps_clue = state.clues.iter().find_map(|clue| match &clue.kind {
        ClueKind::Metadata { key, value, .. } if key == "gps" => Some((clue.id, value.clone())),
        _ => None,
    });

    match gps_clue {
        Some((id, coords)) => Hypothesis {
            id: String::new(),
            iteration: state.iteration,
            region: format!("near {coords}"),
            rationale: "derived from the image's embedded GPS tag".to_string(),
            supporting_clues: BTreeSet::from([id]),
            conflicting_clues: BTreeSet::new(),
            confidence: 0.5,
        },
        None => Hypothesis {
            id: String::new(),
            iteration: state.iteration,
            region: "unknown region".to_string(),
            rationale: "no usable clues; hypothesis model unavailable".to_string(),
            supporting_clues: BTreeSet::new(),
            conflicting_clues: BTreeSet::new(),
            confidence: 0.1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::state::ImageRef;

    fn state_with_clues() -> RunState {
        let mut state = RunState::new(ImageRef {
            path: None,
            content_hash: "t".to_string(),
        });
        state
            .clues
            .push(ClueKind::Text {
                text: "Eiffel Tower".to_string(),
                region: None,
                confidence: 0.9,
                language: Some("en".to_string()),
            })
            .unwrap();
        state
    }

    #[test]
    fn test_parse_valid_hypotheses() {
        let content = r#"[
            {"region": "Paris, France", "rationale": "landmark text", "supporting_clue_ids": [0], "confidence": 0.8},
            {"region": "Las Vegas, USA", "rationale": "replica possibility", "supporting_clue_ids": [0], "confidence": 0.2}
        ]"#;
        let raw = parse_hypotheses(content).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].region, "Paris, France");
    }

    #[test]
    fn test_parse_rejects_empty_list() {
        assert!(matches!(
            parse_hypotheses("[]"),
            Err(GeoError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_out_of_range_confidence() {
        let content = r#"[{"region": "Mars", "confidence": 1.5}]"#;
        assert!(matches!(
            parse_hypotheses(content),
            Err(GeoError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_accepts_list_rationale() {
        let content = r#"[{"region": "Tokyo", "rationale": ["kanji text", "rail style"], "confidence": 0.7}]"#;
        let raw = parse_hypotheses(content).unwrap();
        assert_eq!(raw[0].rationale.clone_join(), "kanji text; rail style");
    }

    impl RationaleText {
        fn clone_join(&self) -> String {
            match self {
                Self::Missing => String::new(),
                Self::One(t) => t.clone(),
                Self::Many(p) => p.join("; "),
            }
        }
    }

    #[test]
    fn test_summarize_clues_includes_ids() {
        let state = state_with_clues();
        let summary = summarize_clues(&state);
        assert!(summary.contains("#0"));
        assert!(summary.contains("Eiffel Tower"));
    }

    #[test]
    fn test_build_prompt_includes_history_on_iteration() {
        let mut state = state_with_clues();
        state.hypotheses.push(Hypothesis {
            id: "h0-0".to_string(),
            iteration: 0,
            region: "Paris, France".to_string(),
            rationale: String::new(),
            supporting_clues: BTreeSet::new(),
            conflicting_clues: BTreeSet::new(),
            confidence: 0.4,
        });
        state.iteration = 1;

        let prompt = build_prompt(&state);
        assert!(prompt.contains("do NOT repeat"));
        assert!(prompt.contains("Paris, France"));
    }

    #[test]
    fn test_fallback_prefers_gps_metadata() {
        let mut state = RunState::new(ImageRef {
            path: None,
            content_hash: "t".to_string(),
        });
        state
            .clues
            .push(ClueKind::Metadata {
                key: "gps".to_string(),
                value: "35.681200,139.767100".to_string(),
                source: sdk::state::MetadataSource::Exif,
            })
            .unwrap();

        let hypothesis = fallback_hypothesis(&state);
        assert!(hypothesis.region.contains("35.681200"));
        assert_eq!(hypothesis.confidence, 0.5);
    }

    #[test]
    fn test_fallback_without_clues_is_generic_low_confidence() {
        let state = RunState::new(ImageRef {
            path: None,
            content_hash: "t".to_string(),
        });
        let hypothesis = fallback_hypothesis(&state);
        assert_eq!(hypothesis.region, "unknown region");
        assert!(hypothesis.confidence <= 0.2);
    }
}
