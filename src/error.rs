//! Error taxonomy.
//! Only `PermissionDenied`, `DispatchFailed` and `UploadError` ever reach the
//! user; everything else is absorbed by a cascade or degrades the alert.

use thiserror::Error;

use crate::device::Capability;

/// Engine-level failure kinds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AlertError {
    #[error("permission denied: {0}")]
    PermissionDenied(Capability),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("no location fix available")]
    NoFix,
    #[error("enrichment failed: {0}")]
    EnrichmentFailed(String),
    #[error("evidence upload failed: {0}")]
    UploadError(String),
    #[error("alert dispatch failed: {0}")]
    DispatchFailed(String),
}

impl AlertError {
    /// Whether this failure is surfaced to the person carrying the device.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            AlertError::PermissionDenied(_)
                | AlertError::DispatchFailed(_)
                | AlertError::UploadError(_)
        )
    }
}

/// Failure reported by a device capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(Capability),
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("device timeout")]
    Timeout,
    #[error("device busy: {0}")]
    Busy(Capability),
}

/// Failure talking to an external service (notifier, geodata, uploader).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetworkError::Timeout
        } else if e.is_decode() {
            NetworkError::Decode(e.to_string())
        } else {
            NetworkError::Request(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
