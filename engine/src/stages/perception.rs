//! Perception stage
//!
//! Extracts geographic clues from the input image: OCR text and visual
//! features via the vision-language collaborator, and metadata (EXIF
//! GPS, timestamp, camera) via a local extractor that runs even when
//! the model is down. A model failure degrades the run to a
//! metadata-only clue set rather than aborting it; the clue set is
//! marked degraded so Verification lowers the confidence ceiling.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use sdk::errors::GeoError;
use sdk::state::{BoundingBox, ClueKind, MetadataSource, RunState};

use crate::llm::{extract_json_object, Message, ModelRouter};
use crate::media::ImageFile;

const PERCEPTION_PROMPT: &str = "You are a geolocation analyst. Examine the image and extract \
    every clue about where it was taken.\n\
    Output ONLY a JSON object with two arrays:\n\
    {\n\
      \"ocr\": [{\"text\": \"...\", \"bbox\": [x1,y1,x2,y2], \"confidence\": 0.0-1.0, \"language\": \"ISO code or null\"}],\n\
      \"visual\": [{\"kind\": \"landmark|architecture|vegetation|road_marking|vehicle|signage\", \"value\": \"description\", \"confidence\": 0.0-1.0}]\n\
    }\n\
    Include street signs, storefront names, license plates, landmarks, \
    building styles, vegetation, road markings, and anything else that \
    narrows down the location. Output ONLY the JSON object, no markdown, \
    no explanation.";

/// Intermediate deserialization types for the model's JSON output
#[derive(Debug, Deserialize)]
struct RawPerception {
    #[serde(default)]
    ocr: Vec<RawOcr>,
    #[serde(default)]
    visual: Vec<RawVisual>,
}

#[derive(Debug, Deserialize)]
struct RawOcr {
    text: String,
    #[serde(default)]
    bbox: Option<[i32; 4]>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVisual {
    #[serde(alias = "type")]
    kind: String,
    value: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    bbox: Option<[i32; 4]>,
}

fn bbox(raw: Option<[i32; 4]>) -> Option<BoundingBox> {
    raw.map(|[x1, y1, x2, y2]| BoundingBox { x1, y1, x2, y2 })
}

pub struct PerceptionStage {
    vision: Arc<ModelRouter>,
}

impl PerceptionStage {
    pub fn new(vision: Arc<ModelRouter>) -> Self {
        Self { vision }
    }

    /// Populate the run's clue set from the image.
    ///
    /// Metadata extraction always runs; the vision call gets one retry
    /// with identical input before the stage degrades.
    pub async fn run(&self, image: &ImageFile, state: &mut RunState) -> Result<(), GeoError> {
        info!("Perception: analyzing image {}", state.image.content_hash);

        self.extract_metadata_clues(image, state);

        let messages = [Message::user_with_image(
            PERCEPTION_PROMPT,
            image.attachment(),
        )];

        // One bounded retry with identical input before degrading
        let mut parsed = None;
        for attempt in 0..2 {
            match self.vision.call(&messages).await {
                Ok((content, provider)) => match parse_perception(&content) {
                    Ok(raw) => {
                        debug!("Perception: parsed output from {provider} (attempt {attempt})");
                        parsed = Some(raw);
                        break;
                    }
                    Err(e) => warn!("Perception: unparsable model output (attempt {attempt}): {e}"),
                },
                Err(e) => warn!("Perception: model call failed (attempt {attempt}): {e}"),
            }
        }

        match parsed {
            Some(raw) => {
                let (ocr_count, visual_count) = self.push_model_clues(raw, state);
                info!("Perception: {ocr_count} text clues, {visual_count} visual clues");
            }
            None => {
                state.clues.mark_degraded();
                state.note_degraded("vision model");
                warn!(
                    "Perception degraded to metadata-only ({} clues)",
                    state.clues.len()
                );
            }
        }

        Ok(())
    }

    fn extract_metadata_clues(&self, image: &ImageFile, state: &mut RunState) {
        let meta = image.metadata();
        if let Some((lat, lon)) = meta.gps {
            state
                .clues
                .push(ClueKind::Metadata {
                    key: "gps".to_string(),
                    value: format!("{lat:.6},{lon:.6}"),
                    source: MetadataSource::Exif,
                })
                .ok();
        }
        if let Some(timestamp) = meta.timestamp {
            state
                .clues
                .push(ClueKind::Metadata {
                    key: "timestamp".to_string(),
                    value: timestamp,
                    source: MetadataSource::Exif,
                })
                .ok();
        }
        if let Some(model) = meta.camera_model {
            state
                .clues
                .push(ClueKind::Metadata {
                    key: "camera_model".to_string(),
                    value: model,
                    source: MetadataSource::Exif,
                })
                .ok();
        }
    }

    /// Validate and insert model-extracted clues. Individual rows that
    /// violate the data model are dropped, not propagated.
    fn push_model_clues(&self, raw: RawPerception, state: &mut RunState) -> (usize, usize) {
        let mut ocr_count = 0;
        for ocr in raw.ocr {
            if ocr.text.trim().is_empty() {
                continue;
            }
            let result = state.clues.push(ClueKind::Text {
                text: ocr.text,
                region: bbox(ocr.bbox),
                confidence: ocr.confidence.unwrap_or(0.5),
                language: ocr.language,
            });
            match result {
                Ok(_) => ocr_count += 1,
                Err(e) => warn!("Perception: dropping invalid OCR clue: {e}"),
            }
        }

        let mut visual_count = 0;
        for visual in raw.visual {
            if visual.value.trim().is_empty() {
                continue;
            }
            let result = state.clues.push(ClueKind::Visual {
                kind: visual.kind,
                value: visual.value,
                confidence: visual.confidence.unwrap_or(0.5),
                region: bbox(visual.bbox),
            });
            match result {
                Ok(_) => visual_count += 1,
                Err(e) => warn!("Perception: dropping invalid visual clue: {e}"),
            }
        }

        (ocr_count, visual_count)
    }
}

fn parse_perception(content: &str) -> Result<RawPerception, GeoError> {
    let json_str = extract_json_object(content)
        .ok_or_else(|| GeoError::Parse("no JSON object in perception output".to_string()))?;
    serde_json::from_str(json_str)
        .map_err(|e| GeoError::Parse(format!("perception output: {e}")))
}
