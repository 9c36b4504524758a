//! Retrieval stage
//!
//! Turns hypotheses (and the image itself) into concrete, scorable
//! candidates via two independent sourcing paths that run in parallel:
//!
//! - **embedding path**: the image is matched against a precomputed
//!   geographic grid behind the retrieval collaborator, optionally at
//!   two scales (fine + region) with the results unioned;
//! - **symbolic path**: each current-iteration hypothesis region is
//!   forward-geocoded, and strong text clues are POI-searched around
//!   the geocoded anchor.
//!
//! Either path failing degrades retrieval to the other; only both
//! yielding nothing surfaces `NoCandidates`, which the orchestrator
//! turns into an immediate zero-confidence result.

use std::sync::Arc;

use tracing::{debug, info, warn};

use sdk::errors::GeoError;
use sdk::state::{Candidate, CandidateSource, ClueKind, RunState};

use crate::evidence::dedup_candidates;
use crate::geo::{GeocodeClient, PoiClient};
use crate::media::ImageFile;
use crate::retrieval::{GeoRetriever, RetrievalCache, RetrievalScale};

/// Minimum text-clue confidence for a POI lookup
const POI_CLUE_CONFIDENCE_FLOOR: f64 = 0.6;

/// Text clues POI-searched per iteration
const POI_CLUE_LIMIT: usize = 3;

/// Search radius around a geocoded anchor for POI lookups, meters
const POI_SEARCH_RADIUS_M: u32 = 30_000;

/// Retrieval stage options derived from config.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub multi_scale: bool,
    pub dedup_radius_m: f64,
}

pub struct RetrievalStage {
    retriever: Option<Arc<dyn GeoRetriever>>,
    cache: RetrievalCache,
    geocoder: Arc<GeocodeClient>,
    poi: Arc<PoiClient>,
    options: RetrievalOptions,
}

impl RetrievalStage {
    pub fn new(
        retriever: Option<Arc<dyn GeoRetriever>>,
        cache: RetrievalCache,
        geocoder: Arc<GeocodeClient>,
        poi: Arc<PoiClient>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            retriever,
            cache,
            geocoder,
            poi,
            options,
        }
    }

    /// Source, merge, and deduplicate candidates into the run state.
    pub async fn run(&self, image: &ImageFile, state: &mut RunState) -> Result<(), GeoError> {
        info!("Retrieval: iteration {}", state.iteration);

        // The two sourcing paths are independent; run them in parallel
        let (embedding, symbolic) = tokio::join!(
            self.embedding_path(image),
            self.symbolic_path(state),
        );

        let mut new_candidates = Vec::new();
        match embedding {
            Ok(candidates) => new_candidates.extend(candidates),
            Err(e) => {
                warn!("Retrieval: embedding path degraded: {e}");
                state.note_degraded("embedding retrieval");
            }
        }
        match symbolic {
            Ok(candidates) => new_candidates.extend(candidates),
            Err(e) => {
                warn!("Retrieval: symbolic path degraded: {e}");
                state.note_degraded("geocoding");
            }
        }

        // Carry prior iterations' candidates forward, then dedup the
        // union so re-retrieved places merge instead of duplicating
        let mut all = std::mem::take(&mut state.candidates);
        all.extend(new_candidates);
        let deduped = dedup_candidates(all, self.options.dedup_radius_m);

        if deduped.is_empty() {
            return Err(GeoError::NoCandidates);
        }
        info!("Retrieval: {} candidates after dedup", deduped.len());
        state.candidates = deduped;
        Ok(())
    }

    /// Embedding path: ranked grid cells for the image, cached by
    /// content hash, reverse-geocoded into named candidates.
    async fn embedding_path(&self, image: &ImageFile) -> Result<Vec<Candidate>, GeoError> {
        let Some(retriever) = &self.retriever else {
            return Err(GeoError::CollaboratorUnavailable(
                "no retrieval endpoint configured".to_string(),
            ));
        };

        let mut scales = vec![RetrievalScale::Fine];
        if self.options.multi_scale {
            scales.push(RetrievalScale::Region);
        }

        let mut cells = Vec::new();
        for scale in scales {
            let cached = self
                .cache
                .get(&image.content_hash, self.options.top_k, scale);
            let scale_cells = match cached {
                Some(hit) => {
                    debug!("Retrieval: cache hit for scale {scale}");
                    hit
                }
                None => {
                    let fresh = retriever
                        .retrieve(image, self.options.top_k, scale)
                        .await
                        .map_err(GeoError::from)?;
                    self.cache.put(
                        &image.content_hash,
                        self.options.top_k,
                        scale,
                        fresh.clone(),
                    );
                    fresh
                }
            };
            cells.extend(scale_cells);
        }

        let mut candidates = Vec::new();
        for cell in cells {
            let name = format!("retrieved location ({:.4}, {:.4})", cell.lat, cell.lon);
            let Ok(mut candidate) =
                Candidate::new(name, cell.lat, cell.lon, CandidateSource::Retrieval, cell.score)
            else {
                continue;
            };
            // Best-effort address so evidence checks and the report
            // have something symbolic to work with
            if let Ok(hit) = self.geocoder.reverse_geocode(cell.lat, cell.lon).await {
                candidate.name = hit.name;
                candidate.address = hit.address;
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    /// Symbolic path: geocode hypothesis regions, POI-search strong
    /// text clues around the best geocoded anchor.
    async fn symbolic_path(&self, state: &RunState) -> Result<Vec<Candidate>, GeoError> {
        let mut candidates = Vec::new();
        let mut anchor: Option<(f64, f64)> = None;
        let mut failures = 0usize;
        let mut attempts = 0usize;

        // EXIF geotag, when present, is the strongest symbolic source
        if let Some(gps) = gps_from_metadata(state) {
            attempts += 1;
            match self.geocoder.reverse_geocode(gps.0, gps.1).await {
                Ok(hit) => {
                    if let Ok(mut candidate) =
                        Candidate::new(hit.name, gps.0, gps.1, CandidateSource::Geocode, 0.95)
                    {
                        candidate.address = hit.address;
                        candidates.push(candidate);
                        anchor = Some(gps);
                    }
                }
                Err(e) => {
                    debug!("Retrieval: reverse geocode of EXIF tag failed: {e}");
                    failures += 1;
                    // The tag itself is still a usable candidate
                    if let Ok(candidate) = Candidate::new(
                        format!("geotagged location ({:.4}, {:.4})", gps.0, gps.1),
                        gps.0,
                        gps.1,
                        CandidateSource::Geocode,
                        0.95,
                    ) {
                        candidates.push(candidate);
                        anchor = Some(gps);
                    }
                }
            }
        }

        for hypothesis in state.hypotheses_for_iteration(state.iteration) {
            attempts += 1;
            match self.geocoder.geocode(&hypothesis.region, 3).await {
                Ok(hits) => {
                    for hit in hits {
                        let raw_score =
                            (hypothesis.confidence * hit.importance).clamp(0.0, 1.0);
                        if let Ok(mut candidate) = Candidate::new(
                            hit.name,
                            hit.lat,
                            hit.lon,
                            CandidateSource::Geocode,
                            raw_score,
                        ) {
                            if anchor.is_none() {
                                anchor = Some((candidate.lat, candidate.lon));
                            }
                            candidate.address = hit.address;
                            candidates.push(candidate);
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        "Retrieval: geocode of '{}' failed: {e}",
                        hypothesis.region
                    );
                    failures += 1;
                }
            }
        }

        // POI lookups need a spatial anchor; skip without one
        if let Some(center) = anchor {
            for (text, confidence) in strong_text_clues(state) {
                attempts += 1;
                match self.poi.search(&text, center, POI_SEARCH_RADIUS_M).await {
                    Ok(pois) => {
                        for poi in pois.into_iter().take(3) {
                            let raw_score = (confidence * 0.7).clamp(0.0, 1.0);
                            if let Ok(candidate) = Candidate::new(
                                poi.name,
                                poi.lat,
                                poi.lon,
                                CandidateSource::Poi,
                                raw_score,
                            ) {
                                candidates.push(candidate);
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Retrieval: POI search for '{text}' failed: {e}");
                        failures += 1;
                    }
                }
            }
        }

        // Only a fully failed path (every lookup errored) reports as
        // degraded; partial failure is normal operation
        if candidates.is_empty() && attempts > 0 && failures == attempts {
            return Err(GeoError::CollaboratorUnavailable(
                "all symbolic lookups failed".to_string(),
            ));
        }
        Ok(candidates)
    }
}

/// EXIF geotag from the metadata clues, if Perception found one.
fn gps_from_metadata(state: &RunState) -> Option<(f64, f64)> {
    state.clues.iter().find_map(|clue| match &clue.kind {
        ClueKind::Metadata { key, value, .. } if key == "gps" => {
            let (lat, lon) = value.split_once(',')?;
            let lat: f64 = lat.trim().parse().ok()?;
            let lon: f64 = lon.trim().parse().ok()?;
            (sdk::geo::is_valid_lat(lat) && sdk::geo::is_valid_lon(lon)).then_some((lat, lon))
        }
        _ => None,
    })
}

/// High-confidence text clues worth a POI lookup, best first.
fn strong_text_clues(state: &RunState) -> Vec<(String, f64)> {
    let mut clues: Vec<(String, f64)> = state
        .clues
        .iter()
        .filter_map(|clue| match &clue.kind {
            ClueKind::Text {
                text, confidence, ..
            } if *confidence >= POI_CLUE_CONFIDENCE_FLOOR => {
                Some((text.clone(), *confidence))
            }
            _ => None,
        })
        .collect();
    clues.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    clues.truncate(POI_CLUE_LIMIT);
    clues
}
