use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use sdk::geo::{is_valid_lat, is_valid_lon};

use super::{GeoCell, GeoRetriever, RetrievalError, RetrievalScale};
use crate::config::RetrievalConfig;
use crate::media::ImageFile;

/// HTTP client for a geo-embedding inference endpoint.
///
/// The endpoint embeds the posted image, compares it against its
/// precomputed coordinate gallery, and returns the top-K cells.
pub struct RemoteGeoRetriever {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    results: Vec<RawCell>,
}

#[derive(Debug, Deserialize)]
struct RawCell {
    lat: f64,
    lon: f64,
    score: f64,
}

impl RemoteGeoRetriever {
    pub fn new(config: &RetrievalConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl GeoRetriever for RemoteGeoRetriever {
    fn name(&self) -> &str {
        "remote"
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/healthz", self.endpoint);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn retrieve(
        &self,
        image: &ImageFile,
        top_k: usize,
        scale: RetrievalScale,
    ) -> super::Result<Vec<GeoCell>> {
        let url = format!("{}/retrieve", self.endpoint);
        let payload = json!({
            "image_b64": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            "top_k": top_k,
            "scale": scale.to_string(),
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout
                } else {
                    RetrievalError::ModelUnavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 503 {
                RetrievalError::IndexUnavailable(text)
            } else {
                RetrievalError::ModelUnavailable(format!("{status}: {text}"))
            });
        }

        let data: RetrieveResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::ParseError(e.to_string()))?;

        // Drop rows that violate the data model rather than letting
        // them into the shared state
        let cells: Vec<GeoCell> = data
            .results
            .into_iter()
            .filter(|c| is_valid_lat(c.lat) && is_valid_lon(c.lon) && c.score.is_finite())
            .map(|c| GeoCell {
                lat: c.lat,
                lon: c.lon,
                score: c.score.clamp(0.0, 1.0),
            })
            .take(top_k)
            .collect();

        Ok(cells)
    }
}
