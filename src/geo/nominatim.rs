//! Nominatim reverse geocoding.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::Geocoder;
use crate::config::GeoConfig;
use crate::error::NetworkError;

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

pub struct NominatimGeocoder {
    http: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeoConfig) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.nominatim_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Extract the address from a `/reverse?format=json` body.
pub fn parse_reverse(body: &str) -> Result<Option<String>, NetworkError> {
    let parsed: ReverseResponse =
        serde_json::from_str(body).map_err(|e| NetworkError::Decode(e.to_string()))?;
    Ok(parsed.display_name.filter(|s| !s.trim().is_empty()))
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<String>, NetworkError> {
        let resp = self
            .http
            .get(format!("{}/reverse", self.base_url))
            .query(&[
                ("format", "json".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(bytes = body.len(), "nominatim response");
        parse_reverse(&body)
    }
}
