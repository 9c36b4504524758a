use proptest::prelude::*;
use sdk::state::{
    sort_hypotheses, Candidate, CandidateSource, CheckKind, ClueKind, Evidence, EvidenceResult,
    Hypothesis, ImageRef, RunState,
};
use std::collections::BTreeSet;

fn arb_source() -> impl Strategy<Value = CandidateSource> {
    prop_oneof![
        Just(CandidateSource::Retrieval),
        Just(CandidateSource::Geocode),
        Just(CandidateSource::Poi),
    ]
}

proptest! {
    // Serializing then deserializing a RunState produces an identical
    // RunState, field for field.
    #[test]
    fn test_run_state_round_trip(
        texts in prop::collection::vec("[a-zA-Z ]{1,24}", 0..6),
        confidences in prop::collection::vec(0.0..=1.0f64, 6),
        lat in -90.0..=90.0f64,
        lon in -180.0..=180.0f64,
        raw_score in 0.0..=1.0f64,
        delta in 0.0..=1.0f64,
        iteration in 0..4u32,
        source in arb_source(),
    ) {
        let mut state = RunState::new(ImageRef {
            path: None,
            content_hash: "abc123".to_string(),
        });
        state.iteration = iteration;

        for (text, conf) in texts.iter().zip(confidences.iter()) {
            state.clues.push(ClueKind::Text {
                text: text.clone(),
                region: None,
                confidence: *conf,
                language: None,
            }).expect("valid clue");
        }

        let candidate = Candidate::new("somewhere", lat, lon, source, raw_score)
            .expect("valid candidate");
        let candidate_id = candidate.id.clone();
        state.candidates.push(candidate);

        state.hypotheses.push(Hypothesis {
            id: "h1".to_string(),
            iteration,
            region: "Somewhere/Region".to_string(),
            rationale: "derived from text clues".to_string(),
            supporting_clues: BTreeSet::new(),
            conflicting_clues: BTreeSet::new(),
            confidence: raw_score,
        });

        state.add_evidence(Evidence::new(
            candidate_id,
            CheckKind::TextMatch,
            EvidenceResult::Support,
            delta,
            "matched",
        ).expect("valid evidence"));

        let json = serde_json::to_string(&state).expect("serialize");
        let parsed: RunState = serde_json::from_str(&json).expect("deserialize");

        prop_assert_eq!(state, parsed);
    }

    // Merging two candidates within the proximity threshold twice
    // yields the same merged candidate as merging once.
    #[test]
    fn test_candidate_merge_idempotent(
        lat in -89.0..=89.0f64,
        lon in -179.0..=179.0f64,
        score_a in 0.0..=1.0f64,
        score_b in 0.0..=1.0f64,
        src_a in arb_source(),
        src_b in arb_source(),
    ) {
        let mut merged = Candidate::new("a", lat, lon, src_a, score_a).expect("valid");
        let other = Candidate::new("b", lat + 0.001, lon + 0.001, src_b, score_b).expect("valid");

        merged.merge(&other);
        let once = merged.clone();
        merged.merge(&other);

        prop_assert_eq!(once, merged);
    }

    // Sorting hypotheses is deterministic and orders by confidence
    // descending.
    #[test]
    fn test_hypothesis_sort_is_ordered_and_stable(
        confidences in prop::collection::vec(0.0..=1.0f64, 1..8),
    ) {
        let mut hypotheses: Vec<Hypothesis> = confidences
            .iter()
            .enumerate()
            .map(|(i, c)| Hypothesis {
                id: format!("h{i}"),
                iteration: 0,
                region: format!("region {i}"),
                rationale: String::new(),
                supporting_clues: BTreeSet::new(),
                conflicting_clues: BTreeSet::new(),
                confidence: *c,
            })
            .collect();

        sort_hypotheses(&mut hypotheses);
        for pair in hypotheses.windows(2) {
            prop_assert!(pair[0].confidence >= pair[1].confidence);
        }

        let mut again = hypotheses.clone();
        sort_hypotheses(&mut again);
        prop_assert_eq!(hypotheses, again);
    }
}
