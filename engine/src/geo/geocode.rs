use serde::Deserialize;
use std::time::Duration;

use sdk::geo::{is_valid_lat, is_valid_lon};

use super::{GeoToolError, PlaceHit};
use crate::config::GeoConfig;

/// Client for a Nominatim-compatible geocoding service.
pub struct GeocodeClient {
    base_url: String,
    client: reqwest::Client,
}

/// Nominatim search/reverse row. Coordinates arrive as strings.
#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    display_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    importance: Option<f64>,
}

impl NominatimPlace {
    fn into_hit(self) -> Option<PlaceHit> {
        let lat: f64 = self.lat.parse().ok()?;
        let lon: f64 = self.lon.parse().ok()?;
        if !is_valid_lat(lat) || !is_valid_lon(lon) {
            return None;
        }
        let name = match self.name {
            Some(n) if !n.is_empty() => n,
            // Fall back to the first display_name component
            _ => self
                .display_name
                .split(',')
                .next()
                .unwrap_or(&self.display_name)
                .trim()
                .to_string(),
        };
        Some(PlaceHit {
            name,
            lat,
            lon,
            address: Some(self.display_name),
            importance: self.importance.unwrap_or(0.5).clamp(0.0, 1.0),
        })
    }
}

impl GeocodeClient {
    pub fn new(config: &GeoConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.nominatim_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Forward geocode a free-text place description.
    pub async fn geocode(&self, query: &str, limit: usize) -> super::Result<Vec<PlaceHit>> {
        if query.trim().is_empty() {
            return Err(GeoToolError::InvalidInput("empty geocode query".to_string()));
        }
        let url = format!("{}/search", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let places: Vec<NominatimPlace> = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GeoToolError::ParseError(e.to_string()))?;

        let hits: Vec<PlaceHit> = places
            .into_iter()
            .filter_map(NominatimPlace::into_hit)
            .collect();
        if hits.is_empty() {
            return Err(GeoToolError::NoMatch(query.to_string()));
        }
        Ok(hits)
    }

    /// Reverse geocode coordinates into an address.
    pub async fn reverse_geocode(&self, lat: f64, lon: f64) -> super::Result<PlaceHit> {
        if !is_valid_lat(lat) || !is_valid_lon(lon) {
            return Err(GeoToolError::InvalidInput(format!(
                "coordinates ({lat}, {lon}) out of range"
            )));
        }
        let url = format!("{}/reverse", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let place: NominatimPlace = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GeoToolError::ParseError(e.to_string()))?;

        place
            .into_hit()
            .ok_or_else(|| GeoToolError::NoMatch(format!("({lat}, {lon})")))
    }
}

fn map_transport_error(e: reqwest::Error) -> GeoToolError {
    if e.is_timeout() {
        GeoToolError::Timeout
    } else {
        GeoToolError::ServiceUnavailable(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> super::Result<reqwest::Response> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(GeoToolError::RateLimited);
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(GeoToolError::ServiceUnavailable(format!("{status}: {text}")));
    }
    Ok(response)
}
