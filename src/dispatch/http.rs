//! HTTP notifier for the SOS backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Ack, AlertPayload, Coordinates, Notifier};
use crate::error::NetworkError;

/// Request body the backend's `send-sos` route expects.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SosRequest<'a> {
    mobile_number: &'a str,
    location: Option<Coordinates>,
    address: Option<&'a str>,
    video_link: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SosResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sid: Option<String>,
}

pub struct HttpNotifier {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

fn request_body(payload: &AlertPayload) -> SosRequest<'_> {
    SosRequest {
        mobile_number: &payload.subject_id,
        location: payload.location,
        address: payload.address.as_deref(),
        video_link: payload.evidence_url.as_deref(),
    }
}

/// Interpret a 2xx reply body. An explicit `success: false` is a failure.
fn parse_ack(body: &str) -> Result<Ack, NetworkError> {
    if body.trim().is_empty() {
        return Ok(Ack {
            id: None,
            message: String::new(),
        });
    }
    let resp: SosResponse = serde_json::from_str(body).map_err(|e| NetworkError::Decode(e.to_string()))?;
    let message = resp.message.unwrap_or_default();
    if resp.success == Some(false) {
        return Err(NetworkError::Request(message));
    }
    Ok(Ack { id: resp.sid, message })
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, payload: &AlertPayload) -> Result<Ack, NetworkError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&request_body(payload))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        debug!(status = status.as_u16(), "sos backend replied");
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_ack(&body)
    }
}
