//! Language and script region priors
//!
//! Script-range language detection over clue text and coarse
//! language→region / coordinate→country tables. This is the
//! `LanguageToRegionPrior` boundary capability: a pure local
//! computation with no failure modes beyond empty input.

/// Language detected from text, with the regions it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguagePrior {
    /// ISO 639-1 code
    pub language: &'static str,
    /// ISO 3166-1 alpha-2 codes where the language is dominant
    pub regions: &'static [&'static str],
    /// How strongly the script pins down the region
    pub confidence: f64,
}

/// Detect the dominant non-Latin script in a text.
///
/// Kana is checked before Han because Japanese text mixes both;
/// Latin-script text returns `None` — it is too widespread to carry a
/// usable prior.
pub fn detect_language(text: &str) -> Option<&'static str> {
    let has = |range: std::ops::RangeInclusive<u32>| {
        text.chars().any(|c| range.contains(&(c as u32)))
    };

    // Hiragana / Katakana
    if has(0x3040..=0x309F) || has(0x30A0..=0x30FF) {
        return Some("ja");
    }
    // Hangul
    if has(0xAC00..=0xD7AF) {
        return Some("ko");
    }
    // Han (after kana: Japanese uses kanji too)
    if has(0x4E00..=0x9FFF) {
        return Some("zh");
    }
    // Arabic
    if has(0x0600..=0x06FF) {
        return Some("ar");
    }
    // Cyrillic
    if has(0x0400..=0x04FF) {
        return Some("ru");
    }
    // Thai
    if has(0x0E00..=0x0E7F) {
        return Some("th");
    }
    // Hebrew
    if has(0x0590..=0x05FF) {
        return Some("he");
    }
    // Greek
    if has(0x0370..=0x03FF) {
        return Some("el");
    }
    // Devanagari
    if has(0x0900..=0x097F) {
        return Some("hi");
    }
    None
}

/// Regions implied by a detected language.
pub fn language_prior(language: &str) -> Option<LanguagePrior> {
    let (language, regions, confidence): (&'static str, &'static [&'static str], f64) =
        match language {
            "ja" => ("ja", &["JP"], 0.9),
            "ko" => ("ko", &["KR", "KP"], 0.9),
            "zh" => ("zh", &["CN", "TW", "HK", "SG"], 0.7),
            "ar" => ("ar", &["SA", "EG", "AE", "MA", "IQ", "JO"], 0.6),
            "ru" => ("ru", &["RU", "BY", "KZ", "UA"], 0.6),
            "th" => ("th", &["TH"], 0.9),
            "he" => ("he", &["IL"], 0.9),
            "el" => ("el", &["GR", "CY"], 0.85),
            "hi" => ("hi", &["IN", "NP"], 0.8),
            _ => return None,
        };
    Some(LanguagePrior {
        language,
        regions,
        confidence,
    })
}

/// Detect the language of a text and map it to a region prior.
pub fn language_to_region_prior(text: &str) -> Option<LanguagePrior> {
    detect_language(text).and_then(language_prior)
}

/// Coarse country bounding boxes: (code, min_lat, max_lat, min_lon, max_lon).
///
/// These deliberately overlap and over-cover; they only need to answer
/// "could this point plausibly be in country X" for the prior check.
const COUNTRY_BOXES: &[(&str, f64, f64, f64, f64)] = &[
    ("JP", 24.0, 46.0, 123.0, 146.0),
    ("KR", 33.0, 39.0, 124.0, 132.0),
    ("KP", 37.5, 43.0, 124.0, 131.0),
    ("CN", 18.0, 54.0, 73.0, 135.0),
    ("TW", 21.5, 25.5, 119.5, 122.5),
    ("HK", 22.1, 22.6, 113.8, 114.5),
    ("SG", 1.1, 1.5, 103.6, 104.1),
    ("TH", 5.5, 20.5, 97.0, 106.0),
    ("VN", 8.0, 23.5, 102.0, 110.0),
    ("IN", 6.5, 35.5, 68.0, 97.5),
    ("NP", 26.3, 30.5, 80.0, 88.3),
    ("RU", 41.0, 82.0, 19.0, 180.0),
    ("BY", 51.0, 56.5, 23.0, 33.0),
    ("KZ", 40.5, 55.5, 46.5, 87.5),
    ("UA", 44.0, 52.5, 22.0, 40.5),
    ("SA", 16.0, 32.5, 34.5, 56.0),
    ("EG", 22.0, 31.8, 24.5, 37.0),
    ("AE", 22.5, 26.5, 51.0, 56.5),
    ("MA", 27.5, 36.0, -13.5, -1.0),
    ("IQ", 29.0, 37.5, 38.5, 49.0),
    ("JO", 29.0, 33.5, 34.5, 39.5),
    ("IL", 29.4, 33.4, 34.2, 35.9),
    ("GR", 34.5, 42.0, 19.0, 29.8),
    ("CY", 34.5, 35.8, 32.0, 34.7),
    ("US", 24.0, 50.0, -125.0, -66.0),
    ("FR", 41.0, 51.5, -5.5, 10.0),
    ("DE", 47.0, 55.5, 5.5, 15.5),
    ("GB", 49.5, 61.0, -8.5, 2.0),
];

/// Country codes whose bounding box contains the point.
pub fn countries_at(lat: f64, lon: f64) -> Vec<&'static str> {
    COUNTRY_BOXES
        .iter()
        .filter(|(_, min_lat, max_lat, min_lon, max_lon)| {
            (*min_lat..=*max_lat).contains(&lat) && (*min_lon..=*max_lon).contains(&lon)
        })
        .map(|(code, ..)| *code)
        .collect()
}
