//! Overpass API point-of-interest search.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{PlaceCategory, PlaceRecord, PlacesSearch};
use crate::config::GeoConfig;
use crate::error::NetworkError;

#[derive(Debug, Deserialize)]
struct InterpreterResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

pub struct OverpassSearch {
    http: reqwest::Client,
    url: String,
}

impl OverpassSearch {
    pub fn new(config: &GeoConfig) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            url: config.overpass_url.clone(),
        })
    }
}

/// Overpass QL for nodes of `category` within `radius_m` of a point.
pub fn build_query(latitude: f64, longitude: f64, radius_m: u32, category: PlaceCategory) -> String {
    format!(
        "[out:json];node(around:{radius_m},{latitude},{longitude})[amenity={}];out;",
        category.amenity()
    )
}

/// Elements in response order. Nodes without coordinates are skipped.
pub fn parse_elements(body: &str) -> Result<Vec<PlaceRecord>, NetworkError> {
    let parsed: InterpreterResponse =
        serde_json::from_str(body).map_err(|e| NetworkError::Decode(e.to_string()))?;
    Ok(parsed
        .elements
        .into_iter()
        .filter_map(|el| {
            Some(PlaceRecord {
                latitude: el.lat?,
                longitude: el.lon?,
                tags: el.tags,
            })
        })
        .collect())
}

#[async_trait]
impl PlacesSearch for OverpassSearch {
    async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: u32,
        category: PlaceCategory,
    ) -> Result<Vec<PlaceRecord>, NetworkError> {
        let query = build_query(latitude, longitude, radius_m, category);
        let resp = self.http.get(&self.url).query(&[("data", query)]).send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_elements(&body)
    }
}
