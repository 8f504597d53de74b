//! Activation pipeline: locate → (alert ∥ enrich) → evidence follow-up.
//!
//! Location always comes first. The first alert goes out as soon as the
//! location (or its absence) is known, without waiting for the address. If
//! evidence is uploaded afterwards, one follow-up carries the URL together with
//! the same location and whatever address enrichment produced by then.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::{Ack, AlertDispatcher, AlertRound};
use crate::error::AlertError;
use crate::events::{EngineEvent, EventBus};
use crate::evidence::UploadTicket;
use crate::geo::{EnrichedLocation, GeoEnrichment};
use crate::location::{LocationAcquirer, LocationSample};
use crate::metrics::{metric_names, MetricsRegistry};

pub struct ActivationPipeline {
    pub generation: u64,
    pub triggered_at: Instant,
    pub acquirer: Arc<LocationAcquirer>,
    pub enrichment: Arc<GeoEnrichment>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub evidence: Option<UploadTicket>,
    pub events: EventBus,
    pub metrics: Arc<MetricsRegistry>,
}

/// What one activation produced.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub location: Option<LocationSample>,
    pub enriched: Option<EnrichedLocation>,
    pub initial: Option<Result<Ack, AlertError>>,
    pub followup: Option<Result<Ack, AlertError>>,
}

impl ActivationPipeline {
    pub async fn run(mut self) -> PipelineReport {
        let generation = self.generation;
        let location = self.locate().await;

        // Evidence that finished before the first alert rides along with it.
        let mut early_url = None;
        if let Some(ticket) = self.evidence.as_mut() {
            match ticket.try_recv() {
                Ok(Ok(url)) => {
                    early_url = Some(url);
                    self.evidence = None;
                }
                Ok(Err(_)) | Err(oneshot::error::TryRecvError::Closed) => self.evidence = None,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }

        let evidence = self.evidence.take();
        let round = AlertRound::new(Arc::clone(&self.dispatcher), location);
        let address: Mutex<Option<String>> = Mutex::new(None);
        let (initial_done_tx, initial_done_rx) = oneshot::channel::<()>();

        let initial = async {
            let span = self.metrics.span(metric_names::ALERT_SENT);
            let result = round.send_initial(None, early_url).await;
            if let Some(Ok(ack)) = &result {
                span.finish();
                self.metrics.record(
                    metric_names::TRIGGER_TO_ALERT,
                    self.triggered_at.elapsed().as_micros() as f64,
                );
                self.events.emit(EngineEvent::AlertSent {
                    ack: ack.clone(),
                    followup: false,
                });
            }
            if let Some(Err(e)) = &result {
                self.events.report(e.clone());
            }
            let _ = initial_done_tx.send(());
            result
        };

        let enrich = async {
            let sample = location?;
            let span = self.metrics.span(metric_names::ENRICHMENT_DONE);
            let enriched = self.enrichment.enrich(sample).await;
            span.finish();
            for failure in &enriched.failures {
                debug!(generation, error = %failure, "enrichment degraded");
            }
            if let Some(addr) = &enriched.address {
                *address.lock() = Some(addr.clone());
                self.events.emit(EngineEvent::AddressResolved(addr.clone()));
            }
            if let Some(station) = &enriched.nearest_station {
                self.events.emit(EngineEvent::StationFound(station.clone()));
            }
            Some(enriched)
        };

        let followup = async {
            let ticket = evidence?;
            let url = match ticket.await {
                Ok(Ok(url)) => url,
                Ok(Err(e)) => {
                    debug!(generation, error = %e, "no evidence to follow up with");
                    return None;
                }
                Err(_) => {
                    debug!(generation, "evidence capture ended without a result");
                    return None;
                }
            };
            let _ = initial_done_rx.await;
            let span = self.metrics.span(metric_names::FOLLOWUP_SENT);
            let current_address = address.lock().clone();
            let result = round.send_followup(current_address, url).await;
            match &result {
                Some(Ok(ack)) => {
                    span.finish();
                    self.events.emit(EngineEvent::AlertSent {
                        ack: ack.clone(),
                        followup: true,
                    });
                }
                Some(Err(e)) => self.events.report(e.clone()),
                None => {}
            }
            result
        };

        let (initial, enriched, followup) = tokio::join!(initial, enrich, followup);
        info!(
            generation,
            sends = round.sends(),
            has_location = location.is_some(),
            "activation_pipeline_done"
        );
        PipelineReport {
            location,
            enriched,
            initial,
            followup,
        }
    }

    async fn locate(&self) -> Option<LocationSample> {
        let span = self.metrics.span(metric_names::LOCATION_ACQUIRED);
        match self.acquirer.acquire().await {
            Ok(sample) => {
                span.finish();
                self.events.emit(EngineEvent::LocationAcquired(sample));
                Some(sample)
            }
            Err(e) => {
                warn!(generation = self.generation, error = %e, "alerting without location");
                self.events.emit(EngineEvent::LocationUnavailable);
                None
            }
        }
    }
}
