//! Alert dispatch.
//! Delivery is at-least-once: an activation sends an alert as soon as the
//! location (or its absence) is known, and at most one follow-up once evidence
//! has been uploaded.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AlertError, NetworkError};
use crate::location::LocationSample;

pub use self::http::HttpNotifier;

/// Upper bound on sends per activation: initial alert plus evidence follow-up.
pub const MAX_SENDS_PER_ROUND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&LocationSample> for Coordinates {
    fn from(sample: &LocationSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
        }
    }
}

/// What one alert carries. Absent fields serialize as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub subject_id: String,
    pub location: Option<Coordinates>,
    pub address: Option<String>,
    pub evidence_url: Option<String>,
}

/// Delivery receipt from a notifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub id: Option<String>,
    pub message: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, payload: &AlertPayload) -> Result<Ack, NetworkError>;
}

/// SMS-style alert text.
pub fn format_alert_message(payload: &AlertPayload) -> String {
    let mut body = format!("SOS! {} needs help.", payload.subject_id);
    match &payload.location {
        Some(c) => body.push_str(&format!(
            " Location: https://www.openstreetmap.org/?mlat={lat}&mlon={lon}#map=16/{lat}/{lon}",
            lat = c.latitude,
            lon = c.longitude
        )),
        None => body.push_str(" Location unavailable"),
    }
    if let Some(address) = &payload.address {
        body.push_str(&format!("\nAddress: {address}"));
    }
    if let Some(url) = &payload.evidence_url {
        body.push_str(&format!("\nVideo Evidence: {url}"));
    }
    body
}

/// Notifier used when no alert backend is configured: logs the message.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, payload: &AlertPayload) -> Result<Ack, NetworkError> {
        let message = format_alert_message(payload);
        let id = format!("log-{}", uuid::Uuid::new_v4());
        info!(id = %id, subject = %payload.subject_id, %message, "alert_logged");
        Ok(Ack {
            id: Some(id),
            message: "logged".into(),
        })
    }
}

pub struct AlertDispatcher {
    subject_id: String,
    notifier: Arc<dyn Notifier>,
}

impl AlertDispatcher {
    pub fn new(subject_id: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            subject_id: subject_id.into(),
            notifier,
        }
    }

    pub async fn dispatch(
        &self,
        location: Option<&LocationSample>,
        address: Option<String>,
        evidence_url: Option<String>,
    ) -> Result<Ack, AlertError> {
        let payload = AlertPayload {
            subject_id: self.subject_id.clone(),
            location: location.map(Coordinates::from),
            address,
            evidence_url,
        };
        match self.notifier.send(&payload).await {
            Ok(ack) => {
                info!(
                    has_location = payload.location.is_some(),
                    has_address = payload.address.is_some(),
                    has_evidence = payload.evidence_url.is_some(),
                    "alert_dispatched"
                );
                Ok(ack)
            }
            Err(e) => {
                warn!(error = %e, "alert dispatch failed");
                Err(AlertError::DispatchFailed(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Default)]
struct RoundState {
    sends: u8,
    evidence_sent: bool,
}

/// Send bookkeeping for one activation.
pub struct AlertRound {
    dispatcher: Arc<AlertDispatcher>,
    location: Option<LocationSample>,
    state: Mutex<RoundState>,
}

impl AlertRound {
    pub fn new(dispatcher: Arc<AlertDispatcher>, location: Option<LocationSample>) -> Self {
        Self {
            dispatcher,
            location,
            state: Mutex::new(RoundState::default()),
        }
    }

    pub fn sends(&self) -> u8 {
        self.state.lock().sends
    }

    /// First alert. `None` if this round already sent it.
    pub async fn send_initial(
        &self,
        address: Option<String>,
        evidence_url: Option<String>,
    ) -> Option<Result<Ack, AlertError>> {
        {
            let mut state = self.state.lock();
            if state.sends > 0 {
                return None;
            }
            state.sends = 1;
            state.evidence_sent = evidence_url.is_some();
        }
        Some(
            self.dispatcher
                .dispatch(self.location.as_ref(), address, evidence_url)
                .await,
        )
    }

    /// Evidence follow-up. `None` when the evidence already went out with the
    /// first alert or the round is exhausted.
    pub async fn send_followup(
        &self,
        address: Option<String>,
        evidence_url: String,
    ) -> Option<Result<Ack, AlertError>> {
        {
            let mut state = self.state.lock();
            if state.evidence_sent || state.sends >= MAX_SENDS_PER_ROUND {
                return None;
            }
            state.sends += 1;
            state.evidence_sent = true;
        }
        Some(
            self.dispatcher
                .dispatch(self.location.as_ref(), address, Some(evidence_url))
                .await,
        )
    }
}
