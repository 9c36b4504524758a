//! Evidence checkers
//!
//! Each checker is a pure function from (candidate, prepared context)
//! to at most one typed evidence record. The Verification stage
//! prefetches any network context (nearby POIs, road classes) before
//! the checkers run, so a checker itself never blocks and never fails.
//!
//! A checker returns `None` when it simply does not apply (no text
//! clues, no topology context); an applicable-but-indecisive check
//! records a Neutral result with a zero delta so the ledger shows the
//! check ran.

use sdk::state::{Candidate, CheckKind, ClueKind, ClueSet, Evidence, EvidenceResult};

use super::language::{countries_at, language_to_region_prior};
use super::text_match::best_match;
use super::EvidenceWeights;
use crate::geo::Poi;

/// Prepared inputs for one candidate's checker runs.
pub struct CheckContext<'a> {
    pub clues: &'a ClueSet,
    /// Named POIs near the candidate (prefetched)
    pub nearby_pois: &'a [Poi],
    /// Road classes near the candidate; `None` when topology context
    /// was not fetched (check disabled or service degraded)
    pub roads: Option<&'a [String]>,
}

/// One pure evidence checker.
pub trait EvidenceCheck: Send + Sync {
    fn kind(&self) -> CheckKind;

    /// Run the check; `None` means not applicable.
    fn run(&self, candidate: &Candidate, ctx: &CheckContext<'_>) -> Option<Evidence>;
}

/// The checkers enabled by the given configuration.
pub fn build_checks(weights: EvidenceWeights, topology: bool) -> Vec<Box<dyn EvidenceCheck>> {
    let mut checks: Vec<Box<dyn EvidenceCheck>> = vec![
        Box::new(TextPlaceCheck {
            weight: weights.text_match,
        }),
        Box::new(LanguagePriorCheck {
            weight: weights.language_prior,
        }),
    ];
    if topology {
        checks.push(Box::new(TopologyCheck {
            weight: weights.topology,
        }));
    }
    checks
}

/// Text clues (and landmark descriptions) worth matching against
/// place names.
fn matchable_texts(clues: &ClueSet) -> Vec<(&str, f64)> {
    clues
        .iter()
        .filter_map(|clue| match &clue.kind {
            ClueKind::Text {
                text, confidence, ..
            } => Some((text.as_str(), *confidence)),
            ClueKind::Visual {
                kind,
                value,
                confidence,
                ..
            } if kind == "landmark" => Some((value.as_str(), *confidence)),
            _ => None,
        })
        .collect()
}

/// Fuzzy/substring matching of clue text against the candidate's name,
/// address, and surrounding POI names.
pub struct TextPlaceCheck {
    pub weight: f64,
}

const TEXT_SUPPORT_THRESHOLD: f64 = 0.6;
const TEXT_CONTRADICT_THRESHOLD: f64 = 0.3;

impl EvidenceCheck for TextPlaceCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::TextMatch
    }

    fn run(&self, candidate: &Candidate, ctx: &CheckContext<'_>) -> Option<Evidence> {
        let texts = matchable_texts(ctx.clues);
        if texts.is_empty() {
            return None;
        }

        let mut targets: Vec<&str> = vec![candidate.name.as_str()];
        if let Some(address) = &candidate.address {
            targets.push(address.as_str());
        }
        targets.extend(ctx.nearby_pois.iter().map(|p| p.name.as_str()));

        let clue_texts: Vec<&str> = texts.iter().map(|(t, _)| *t).collect();
        let (score, clue, target) = best_match(&clue_texts, &targets)?;

        // Weight the match by the extraction confidence of the clue
        let clue_conf = texts
            .iter()
            .find(|(t, _)| *t == clue)
            .map(|(_, c)| *c)
            .unwrap_or(1.0);

        if score >= TEXT_SUPPORT_THRESHOLD {
            return Evidence::new(
                &candidate.id,
                CheckKind::TextMatch,
                EvidenceResult::Support,
                self.weight * score * clue_conf,
                format!("\"{clue}\" matches \"{target}\" (score {score:.2})"),
            )
            .ok();
        }

        // Confident text clues with a rich POI context and no match at
        // all count against the candidate
        let has_strong_clue = texts.iter().any(|(_, c)| *c >= 0.6);
        if score < TEXT_CONTRADICT_THRESHOLD && has_strong_clue && ctx.nearby_pois.len() >= 3 {
            return Evidence::new(
                &candidate.id,
                CheckKind::TextMatch,
                EvidenceResult::Contradict,
                -self.weight * 0.5,
                format!(
                    "no clue text matches any of {} nearby places (best {score:.2})",
                    ctx.nearby_pois.len()
                ),
            )
            .ok();
        }

        Evidence::new(
            &candidate.id,
            CheckKind::TextMatch,
            EvidenceResult::Neutral,
            0.0,
            format!("inconclusive text match (best {score:.2})"),
        )
        .ok()
    }
}

/// Script/language of clue text vs the candidate's country.
pub struct LanguagePriorCheck {
    pub weight: f64,
}

impl EvidenceCheck for LanguagePriorCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::LanguagePrior
    }

    fn run(&self, candidate: &Candidate, ctx: &CheckContext<'_>) -> Option<Evidence> {
        let combined: String = ctx
            .clues
            .iter()
            .filter_map(|c| match &c.kind {
                ClueKind::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ");
        if combined.trim().is_empty() {
            return None;
        }

        // Latin-script text carries no usable prior
        let prior = language_to_region_prior(&combined)?;

        let countries = countries_at(candidate.lat, candidate.lon);
        if countries.is_empty() {
            return Evidence::new(
                &candidate.id,
                CheckKind::LanguagePrior,
                EvidenceResult::Neutral,
                0.0,
                format!(
                    "detected '{}' text but candidate is outside mapped regions",
                    prior.language
                ),
            )
            .ok();
        }

        let consistent = countries.iter().any(|c| prior.regions.contains(c));
        if consistent {
            Evidence::new(
                &candidate.id,
                CheckKind::LanguagePrior,
                EvidenceResult::Support,
                self.weight * prior.confidence,
                format!(
                    "'{}' script is consistent with {}",
                    prior.language,
                    countries.join("/")
                ),
            )
            .ok()
        } else {
            Evidence::new(
                &candidate.id,
                CheckKind::LanguagePrior,
                EvidenceResult::Contradict,
                -self.weight * prior.confidence,
                format!(
                    "'{}' script is inconsistent with {}",
                    prior.language,
                    countries.join("/")
                ),
            )
            .ok()
        }
    }
}

/// Scene class inferred from visual clues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scene {
    Highway,
    Urban,
    Rural,
}

fn infer_scene(clues: &ClueSet) -> Option<Scene> {
    let mut highway = 0usize;
    let mut urban = 0usize;
    let mut rural = 0usize;

    for clue in clues.iter() {
        let ClueKind::Visual { kind, value, .. } = &clue.kind else {
            continue;
        };
        let haystack = format!("{} {}", kind, value).to_lowercase();
        if ["highway", "motorway", "freeway", "expressway"]
            .iter()
            .any(|k| haystack.contains(k))
        {
            highway += 1;
        } else if ["street", "storefront", "building", "architecture", "urban", "crosswalk"]
            .iter()
            .any(|k| haystack.contains(k))
        {
            urban += 1;
        } else if ["vegetation", "forest", "field", "rural", "mountain", "beach", "farmland"]
            .iter()
            .any(|k| haystack.contains(k))
        {
            rural += 1;
        }
    }

    match (highway, urban, rural) {
        (0, 0, 0) => None,
        _ if highway >= urban && highway >= rural && highway > 0 => Some(Scene::Highway),
        _ if urban >= rural => Some(Scene::Urban),
        _ => Some(Scene::Rural),
    }
}

fn observed_scene(roads: &[String]) -> Scene {
    if roads.iter().any(|r| r == "motorway" || r == "trunk") {
        return Scene::Highway;
    }
    let urban_classes = ["residential", "pedestrian", "living_street", "service"];
    if roads.len() >= 5 || roads.iter().any(|r| urban_classes.contains(&r.as_str())) {
        return Scene::Urban;
    }
    Scene::Rural
}

/// Road layout near the candidate vs the visual scene in the image.
pub struct TopologyCheck {
    pub weight: f64,
}

impl EvidenceCheck for TopologyCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Topology
    }

    fn run(&self, candidate: &Candidate, ctx: &CheckContext<'_>) -> Option<Evidence> {
        let roads = ctx.roads?;
        let expected = infer_scene(ctx.clues)?;
        let observed = observed_scene(roads);

        if expected == observed {
            Evidence::new(
                &candidate.id,
                CheckKind::Topology,
                EvidenceResult::Support,
                self.weight * 0.6,
                format!("scene {expected:?} matches road layout"),
            )
            .ok()
        } else {
            Evidence::new(
                &candidate.id,
                CheckKind::Topology,
                EvidenceResult::Contradict,
                -self.weight * 0.6,
                format!("scene {expected:?} vs observed {observed:?} road layout"),
            )
            .ok()
        }
    }
}
