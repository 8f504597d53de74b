//! Best-effort enrichment of a location: street address and nearest police
//! station. Both lookups are independent; a failure only omits its field.

pub mod nominatim;
pub mod overpass;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AlertError, NetworkError};
use crate::location::LocationSample;

pub use self::nominatim::NominatimGeocoder;
pub use self::overpass::OverpassSearch;

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Human-readable address for a coordinate, `None` if the provider has none.
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<String>, NetworkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceCategory {
    Police,
}

impl PlaceCategory {
    /// OpenStreetMap `amenity` tag value.
    pub fn amenity(self) -> &'static str {
        match self {
            PlaceCategory::Police => "police",
        }
    }
}

/// A raw point of interest as returned by a places provider.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaceRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub tags: HashMap<String, String>,
}

#[async_trait]
pub trait PlacesSearch: Send + Sync {
    /// Records within `radius_m`, in provider order.
    async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: u32,
        category: PlaceCategory,
    ) -> Result<Vec<PlaceRecord>, NetworkError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoliceStation {
    pub name: String,
    pub phone: Option<String>,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl PoliceStation {
    pub fn from_place(place: &PlaceRecord) -> Self {
        let tag = |k: &str| place.tags.get(k).map(String::as_str).filter(|v| !v.is_empty());
        let street = tag("addr:street").unwrap_or_default();
        let number = tag("addr:housenumber").unwrap_or_default();
        let city = tag("addr:city").unwrap_or_default();
        Self {
            name: tag("name").unwrap_or("Police Station").to_string(),
            phone: tag("phone").or_else(|| tag("contact:phone")).map(str::to_string),
            address: format!("{street} {number}, {city}"),
            latitude: place.latitude,
            longitude: place.longitude,
        }
    }
}

/// A location with whatever enrichment succeeded. `failures` holds one
/// `EnrichmentFailed` per lookup that errored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedLocation {
    pub sample: LocationSample,
    pub address: Option<String>,
    pub nearest_station: Option<PoliceStation>,
    #[serde(skip)]
    pub failures: Vec<AlertError>,
}

pub struct GeoEnrichment {
    geocoder: Arc<dyn Geocoder>,
    places: Arc<dyn PlacesSearch>,
    station_radius_m: u32,
}

impl GeoEnrichment {
    pub fn new(geocoder: Arc<dyn Geocoder>, places: Arc<dyn PlacesSearch>, station_radius_m: u32) -> Self {
        Self {
            geocoder,
            places,
            station_radius_m,
        }
    }

    async fn lookup_address(&self, latitude: f64, longitude: f64) -> Result<Option<String>, AlertError> {
        self.geocoder
            .reverse(latitude, longitude)
            .await
            .map_err(|e| AlertError::EnrichmentFailed(format!("reverse geocode: {e}")))
    }

    async fn lookup_station(&self, latitude: f64, longitude: f64) -> Result<Option<PoliceStation>, AlertError> {
        let places = self
            .places
            .nearby(latitude, longitude, self.station_radius_m, PlaceCategory::Police)
            .await
            .map_err(|e| AlertError::EnrichmentFailed(format!("police station lookup: {e}")))?;
        Ok(places.first().map(PoliceStation::from_place))
    }

    /// Single attempt, never retried.
    pub async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<String> {
        absorb(self.lookup_address(latitude, longitude).await, &mut Vec::new())
    }

    /// The first station the provider returns. Results are not re-sorted by
    /// distance.
    pub async fn find_nearest_station(&self, latitude: f64, longitude: f64) -> Option<PoliceStation> {
        absorb(self.lookup_station(latitude, longitude).await, &mut Vec::new())
    }

    /// Run both lookups concurrently.
    pub async fn enrich(&self, sample: LocationSample) -> EnrichedLocation {
        let (address, station) = tokio::join!(
            self.lookup_address(sample.latitude, sample.longitude),
            self.lookup_station(sample.latitude, sample.longitude),
        );
        let mut failures = Vec::new();
        let address = absorb(address, &mut failures);
        let nearest_station = absorb(station, &mut failures);
        info!(
            has_address = address.is_some(),
            has_station = nearest_station.is_some(),
            failed = failures.len(),
            "enrichment_done"
        );
        EnrichedLocation {
            sample,
            address,
            nearest_station,
            failures,
        }
    }
}

/// A failed lookup only omits its field.
fn absorb<T>(result: Result<Option<T>, AlertError>, failures: &mut Vec<AlertError>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "enrichment lookup failed");
            failures.push(e);
            None
        }
    }
}
