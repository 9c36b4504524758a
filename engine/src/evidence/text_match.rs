//! Text matching primitives
//!
//! Pure string comparison used by the text-to-place evidence checker:
//! normalization, substring containment, and a bigram Dice similarity
//! for fuzzy matching of OCR'd signage against place names.

use sdk::errors::GeoError;

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let lowered: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Character bigrams of a normalized string.
fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Fuzzy similarity of two texts, in [0,1].
///
/// Sørensen–Dice coefficient over character bigrams of the normalized
/// inputs, with substring containment as a floor: OCR often captures
/// only part of a sign, so "Eiffel" against "Eiffel Tower" should
/// score high. Errors only on empty input.
pub fn fuzzy_match(text: &str, candidate_text: &str) -> Result<f64, GeoError> {
    let a = normalize_text(text);
    let b = normalize_text(candidate_text);
    if a.is_empty() || b.is_empty() {
        return Err(GeoError::Validation(
            "fuzzy_match requires non-empty inputs".to_string(),
        ));
    }
    if a == b {
        return Ok(1.0);
    }

    // Containment floor, scaled by how much of the longer string is covered
    let (shorter, longer) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    let containment = if longer.contains(shorter.as_str()) {
        0.6 + 0.4 * (shorter.chars().count() as f64 / longer.chars().count() as f64)
    } else {
        0.0
    };

    let ba = bigrams(&a);
    let bb = bigrams(&b);
    if ba.is_empty() || bb.is_empty() {
        // Single-character inputs: equality already handled above
        return Ok(containment);
    }

    let mut remaining = bb.clone();
    let mut overlap = 0usize;
    for bigram in &ba {
        if let Some(pos) = remaining.iter().position(|x| x == bigram) {
            remaining.swap_remove(pos);
            overlap += 1;
        }
    }
    let dice = 2.0 * overlap as f64 / (ba.len() + bb.len()) as f64;

    Ok(dice.max(containment))
}

/// Best match of any clue text against any target text.
///
/// Returns the score and the matching (clue, target) pair.
pub fn best_match<'a>(
    clue_texts: &[&'a str],
    targets: &[&'a str],
) -> Option<(f64, &'a str, &'a str)> {
    let mut best: Option<(f64, &str, &str)> = None;
    for clue in clue_texts {
        for target in targets {
            let Ok(score) = fuzzy_match(clue, target) else {
                continue;
            };
            if best.map_or(true, |(b, _, _)| score > b) {
                best = Some((score, clue, target));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_text("  Tokyo   Station! "), "tokyo station");
        assert_eq!(normalize_text("L'Arc-de-Triomphe"), "l arc de triomphe");
        assert_eq!(normalize_text("..."), "");
    }

    #[test]
    fn test_exact_match_scores_one() {
        assert_eq!(fuzzy_match("Eiffel Tower", "Eiffel Tower").unwrap(), 1.0);
        assert_eq!(fuzzy_match("EIFFEL tower!", "eiffel TOWER").unwrap(), 1.0);
    }

    #[test]
    fn test_substring_scores_high() {
        let score = fuzzy_match("Eiffel", "Eiffel Tower").unwrap();
        assert!(score >= 0.6, "got {score}");
    }

    #[test]
    fn test_unrelated_scores_low() {
        let score = fuzzy_match("Tokyo Station", "Eiffel Tower").unwrap();
        assert!(score < 0.3, "got {score}");
    }

    #[test]
    fn test_typo_scores_moderate() {
        let score = fuzzy_match("Eifel Tower", "Eiffel Tower").unwrap();
        assert!(score > 0.7, "got {score}");
    }

    #[test]
    fn test_empty_input_is_invalid() {
        assert!(fuzzy_match("", "x").is_err());
        assert!(fuzzy_match("x", "  !! ").is_err());
    }

    #[test]
    fn test_symmetry() {
        let a = fuzzy_match("Tour Eiffel", "Eiffel Tower").unwrap();
        let b = fuzzy_match("Eiffel Tower", "Tour Eiffel").unwrap();
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_best_match_picks_highest() {
        let clues = ["Starbucks", "Eiffel Tower"];
        let targets = ["Tour Eiffel", "Louvre"];
        let (score, clue, target) = best_match(&clues, &targets).unwrap();
        assert_eq!(clue, "Eiffel Tower");
        assert_eq!(target, "Tour Eiffel");
        assert!(score > 0.4);
    }

    #[test]
    fn test_best_match_empty_inputs() {
        assert!(best_match(&[], &["x"]).is_none());
        assert!(best_match(&["x"], &[]).is_none());
    }
}
