//! Score fusion and candidate ranking
//!
//! Additive fusion: a candidate's fused score is its retrieval score
//! plus the sum of all evidence deltas, clipped to [0,1]. Additive
//! (rather than multiplicative) because evidence is sparse — few
//! checks apply to any one candidate, and an inapplicable check must
//! not collapse the score. A neutral result contributes exactly zero.

use std::collections::HashMap;

use sdk::state::{Candidate, EvidenceResult, RunState};

/// `clip(raw + Σ delta, 0, 1)`
pub fn fuse_score(raw_score: f64, deltas: impl IntoIterator<Item = f64>) -> f64 {
    let sum: f64 = deltas.into_iter().sum();
    (raw_score + sum).clamp(0.0, 1.0)
}

/// Compute fused scores from the evidence ledger and re-sort the
/// candidate list, best first.
///
/// Ties on fused score break by the number of supporting evidence
/// entries, then by id for determinism. Every candidate's evidence is
/// already fully recorded when this runs (the stage joins the
/// per-candidate checker runs first).
pub fn rank_candidates(state: &mut RunState) {
    let mut deltas: HashMap<String, f64> = HashMap::new();
    let mut support: HashMap<String, usize> = HashMap::new();
    for evidence in state.evidence() {
        *deltas.entry(evidence.candidate.clone()).or_default() += evidence.score_delta;
        if evidence.result == EvidenceResult::Support {
            *support.entry(evidence.candidate.clone()).or_default() += 1;
        }
    }

    for candidate in &mut state.candidates {
        let sum = deltas.get(&candidate.id).copied().unwrap_or(0.0);
        candidate.fused_score = Some((candidate.raw_score + sum).clamp(0.0, 1.0));
    }

    state.candidates.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let sa = support.get(&a.id).copied().unwrap_or(0);
                let sb = support.get(&b.id).copied().unwrap_or(0);
                sb.cmp(&sa).then_with(|| a.id.cmp(&b.id))
            })
    });
}

/// Merge candidates closer than `radius_m` to each other.
///
/// Greedy passes run to a fixpoint: a merge adopts the higher-scored
/// side's coordinates, which can pull two survivors into range of each
/// other, so passes repeat until one completes with no merges. At that
/// point all survivors are pairwise farther apart than the radius,
/// which is what makes the whole operation idempotent.
pub fn dedup_candidates(mut candidates: Vec<Candidate>, radius_m: f64) -> Vec<Candidate> {
    loop {
        let before = candidates.len();
        candidates = dedup_pass(candidates, radius_m);
        if candidates.len() == before {
            return candidates;
        }
    }
}

/// One greedy pass: each candidate merges into the first earlier
/// survivor within range or becomes a survivor itself.
fn dedup_pass(candidates: Vec<Candidate>, radius_m: f64) -> Vec<Candidate> {
    let mut survivors: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match survivors
            .iter_mut()
            .find(|s| s.distance_m(&candidate) <= radius_m)
        {
            Some(survivor) => survivor.merge(&candidate),
            None => survivors.push(candidate),
        }
    }
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::state::{CandidateSource, CheckKind, Evidence, ImageRef};

    fn state() -> RunState {
        RunState::new(ImageRef {
            path: None,
            content_hash: "test".to_string(),
        })
    }

    fn candidate(name: &str, lat: f64, lon: f64, raw: f64) -> Candidate {
        Candidate::new(name, lat, lon, CandidateSource::Retrieval, raw).unwrap()
    }

    #[test]
    fn test_fuse_score_clips() {
        assert_eq!(fuse_score(0.8, [0.5]), 1.0);
        assert_eq!(fuse_score(0.2, [-0.5]), 0.0);
        assert!((fuse_score(0.5, [0.2, -0.1]) - 0.6).abs() < 1e-9);
        assert_eq!(fuse_score(0.5, []), 0.5);
    }

    #[test]
    fn test_support_never_decreases_fused_score() {
        let mut s = state();
        let cand = candidate("A", 0.0, 0.0, 0.5);
        let id = cand.id.clone();
        s.candidates.push(cand);

        rank_candidates(&mut s);
        let before = s.candidates[0].score();

        s.add_evidence(
            Evidence::new(&id, CheckKind::TextMatch, EvidenceResult::Support, 0.2, "").unwrap(),
        );
        rank_candidates(&mut s);
        assert!(s.candidates[0].score() >= before);
    }

    #[test]
    fn test_contradict_never_increases_fused_score() {
        let mut s = state();
        let cand = candidate("A", 0.0, 0.0, 0.5);
        let id = cand.id.clone();
        s.candidates.push(cand);

        rank_candidates(&mut s);
        let before = s.candidates[0].score();

        s.add_evidence(
            Evidence::new(&id, CheckKind::LanguagePrior, EvidenceResult::Contradict, -0.2, "")
                .unwrap(),
        );
        rank_candidates(&mut s);
        assert!(s.candidates[0].score() <= before);
    }

    #[test]
    fn test_rank_ties_break_on_support_count() {
        let mut s = state();
        let a = candidate("A", 0.0, 0.0, 0.5);
        let b = candidate("B", 1.0, 1.0, 0.5);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        s.candidates.push(a);
        s.candidates.push(b);

        // Equal fused scores: B gets a supporting + offsetting neutral
        // record, A gets nothing
        s.add_evidence(
            Evidence::new(&b_id, CheckKind::TextMatch, EvidenceResult::Support, 0.0, "").unwrap(),
        );
        rank_candidates(&mut s);

        assert_eq!(s.candidates[0].id, b_id);
        assert_eq!(s.candidates[1].id, a_id);
    }

    #[test]
    fn test_dedup_merges_within_radius() {
        // Two candidates ~200 m apart with different sources
        let a = candidate("Station A", 35.6812, 139.7671, 0.6);
        let mut b = candidate("Station B", 35.6830, 139.7671, 0.8);
        b.sources = std::collections::BTreeSet::from([CandidateSource::Geocode]);

        let merged = dedup_candidates(vec![a, b], 1000.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "Station B", "higher score wins the name");
        assert_eq!(merged[0].raw_score, 0.8);
        assert!(merged[0].sources.contains(&CandidateSource::Retrieval));
        assert!(merged[0].sources.contains(&CandidateSource::Geocode));
    }

    #[test]
    fn test_dedup_keeps_distant_candidates() {
        let a = candidate("Paris", 48.8584, 2.2945, 0.6);
        let b = candidate("Tokyo", 35.6812, 139.7671, 0.8);
        let merged = dedup_candidates(vec![a, b], 1000.0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_dedup_chains_converge_to_fixpoint() {
        // B's high score moves the A∪B survivor onto B, pulling it
        // within range of C; the fixpoint loop must finish the chain
        let a = candidate("A", 0.0, 0.0, 0.5);
        let c = candidate("C", 0.016, 0.0, 0.4); // ~1.8 km from A
        let b = candidate("B", 0.008, 0.0, 0.9); // ~0.9 km from both

        let merged = dedup_candidates(vec![a, c, b], 1000.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "B");

        let again = dedup_candidates(merged.clone(), 1000.0);
        assert_eq!(merged, again);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let candidates = vec![
            candidate("A", 35.6812, 139.7671, 0.6),
            candidate("B", 35.6830, 139.7671, 0.8),
            candidate("C", 48.8584, 2.2945, 0.7),
            candidate("D", 48.8590, 2.2950, 0.5),
        ];
        let once = dedup_candidates(candidates, 1000.0);
        let twice = dedup_candidates(once.clone(), 1000.0);
        assert_eq!(once, twice);
    }
}
