use serde::Deserialize;
use std::time::Duration;

use sdk::geo::{is_valid_lat, is_valid_lon};

use super::{GeoToolError, Poi};
use crate::config::GeoConfig;

/// Client for an Overpass-compatible POI query service.
pub struct PoiClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    center: Option<OverpassCenter>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct OverpassCenter {
    lat: f64,
    lon: f64,
}

impl OverpassElement {
    fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon, &self.center) {
            (Some(lat), Some(lon), _) => Some((lat, lon)),
            (_, _, Some(center)) => Some((center.lat, center.lon)),
            _ => None,
        }
    }

    fn category(&self) -> Option<String> {
        for key in ["amenity", "shop", "tourism", "leisure", "historic"] {
            if let Some(value) = self.tags.get(key) {
                return Some(value.clone());
            }
        }
        None
    }
}

/// Strip characters that would break out of an Overpass regex literal.
fn sanitize_query(query: &str) -> String {
    query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '\'' | '.'))
        .collect::<String>()
        .trim()
        .to_string()
}

impl PoiClient {
    pub fn new(config: &GeoConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.overpass_url.clone(),
            client,
        }
    }

    async fn run_query(&self, overpass_ql: String) -> super::Result<OverpassResponse> {
        let response = self
            .client
            .post(&self.base_url)
            .form(&[("data", overpass_ql)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeoToolError::Timeout
                } else {
                    GeoToolError::ServiceUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GeoToolError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GeoToolError::ServiceUnavailable(format!("{status}: {text}")));
        }

        response
            .json()
            .await
            .map_err(|e| GeoToolError::ParseError(e.to_string()))
    }

    /// Search named POIs matching `query` within `radius_m` of a point.
    pub async fn search(
        &self,
        query: &str,
        center: (f64, f64),
        radius_m: u32,
    ) -> super::Result<Vec<Poi>> {
        let sanitized = sanitize_query(query);
        if sanitized.is_empty() {
            return Err(GeoToolError::InvalidInput("empty POI query".to_string()));
        }
        if !is_valid_lat(center.0) || !is_valid_lon(center.1) {
            return Err(GeoToolError::InvalidInput(format!(
                "center ({}, {}) out of range",
                center.0, center.1
            )));
        }

        let overpass_ql = format!(
            "[out:json][timeout:25];\n\
             (\n\
               node[\"name\"~\"{q}\",i](around:{r},{lat},{lon});\n\
               way[\"name\"~\"{q}\",i](around:{r},{lat},{lon});\n\
             );\n\
             out center 20;",
            q = sanitized,
            r = radius_m,
            lat = center.0,
            lon = center.1,
        );

        let data = self.run_query(overpass_ql).await?;
        Ok(Self::collect_pois(data))
    }

    /// All named POIs within `radius_m` of a point, regardless of name.
    ///
    /// Used by Verification to build the candidate's surroundings for
    /// the text-match and topology checks.
    pub async fn nearby(&self, center: (f64, f64), radius_m: u32) -> super::Result<Vec<Poi>> {
        if !is_valid_lat(center.0) || !is_valid_lon(center.1) {
            return Err(GeoToolError::InvalidInput(format!(
                "center ({}, {}) out of range",
                center.0, center.1
            )));
        }

        let overpass_ql = format!(
            "[out:json][timeout:25];\n\
             node[\"name\"](around:{r},{lat},{lon});\n\
             out 50;",
            r = radius_m,
            lat = center.0,
            lon = center.1,
        );

        let data = self.run_query(overpass_ql).await?;
        Ok(Self::collect_pois(data))
    }

    /// Highway classes of roads within `radius_m` of a point.
    pub async fn roads_near(
        &self,
        center: (f64, f64),
        radius_m: u32,
    ) -> super::Result<Vec<String>> {
        let overpass_ql = format!(
            "[out:json][timeout:25];\n\
             way[\"highway\"](around:{r},{lat},{lon});\n\
             out tags 30;",
            r = radius_m,
            lat = center.0,
            lon = center.1,
        );

        let data = self.run_query(overpass_ql).await?;
        let mut classes: Vec<String> = data
            .elements
            .iter()
            .filter_map(|e| e.tags.get("highway").cloned())
            .collect();
        classes.sort();
        classes.dedup();
        Ok(classes)
    }

    fn collect_pois(data: OverpassResponse) -> Vec<Poi> {
        data.elements
            .into_iter()
            .filter_map(|e| {
                let (lat, lon) = e.coordinates()?;
                if !is_valid_lat(lat) || !is_valid_lon(lon) {
                    return None;
                }
                let name = e.tags.get("name")?.clone();
                let category = e.category();
                Some(Poi {
                    name,
                    lat,
                    lon,
                    category,
                })
            })
            .collect()
    }
}
