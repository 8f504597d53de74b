//! Engine configuration.
//! Loaded from JSON; every section falls back to its defaults when absent, and a
//! handful of deployment settings can be overridden from the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifies the person the alert is about (the backend uses the mobile number).
    pub subject_id: String,
    pub shake: ShakeConfig,
    pub keyword: KeywordConfig,
    pub location: LocationConfig,
    pub geo: GeoConfig,
    pub evidence: EvidenceConfig,
    pub dispatch: DispatchConfig,
    pub alarm: AlarmConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subject_id: "unknown".into(),
            shake: ShakeConfig::default(),
            keyword: KeywordConfig::default(),
            location: LocationConfig::default(),
            geo: GeoConfig::default(),
            evidence: EvidenceConfig::default(),
            dispatch: DispatchConfig::default(),
            alarm: AlarmConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SAFEGUARD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SAFEGUARD_SUBJECT_ID") {
            self.subject_id = v;
        }
        if let Some(v) = lookup("SAFEGUARD_ALERT_ENDPOINT") {
            self.dispatch.endpoint = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("SAFEGUARD_UPLOAD_URL") {
            self.evidence.upload_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("SAFEGUARD_LOG") {
            self.logging.filter = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shake.threshold.is_nan() || self.shake.threshold <= 0.0 {
            return Err(ConfigError::Invalid("shake.threshold must be positive".into()));
        }
        if self.keyword.safety_word.trim().is_empty() {
            return Err(ConfigError::Invalid("keyword.safety_word is empty".into()));
        }
        if self.evidence.fps == 0 {
            return Err(ConfigError::Invalid("evidence.fps must be at least 1".into()));
        }
        if !(1..=100).contains(&self.evidence.jpeg_quality) {
            return Err(ConfigError::Invalid("evidence.jpeg_quality must be 1-100".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShakeConfig {
    pub threshold: f64,
    pub min_interval_ms: i64,
    pub scale: f64,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            min_interval_ms: 100,
            scale: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordConfig {
    pub safety_word: String,
    pub restart_backoff_ms: u64,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            safety_word: "help".into(),
            restart_backoff_ms: 1_000,
        }
    }
}

impl KeywordConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocationConfig {
    pub fresh_max_age_ms: i64,
    pub fresh_max_accuracy_m: f64,
    pub fix_timeout_ms: u64,
    pub watch_max_age_ms: u64,
    pub watch_timeout_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            fresh_max_age_ms: 10_000,
            fresh_max_accuracy_m: 20.0,
            fix_timeout_ms: 10_000,
            watch_max_age_ms: 10_000,
            watch_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeoConfig {
    pub nominatim_url: String,
    pub overpass_url: String,
    pub station_radius_m: u32,
    pub user_agent: String,
    pub request_timeout_ms: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            nominatim_url: "https://nominatim.openstreetmap.org".into(),
            overpass_url: "https://overpass-api.de/api/interpreter".into(),
            station_radius_m: 5_000,
            user_agent: concat!("safeguard/", env!("CARGO_PKG_VERSION")).into(),
            request_timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub fps: u32,
    /// Start recording as soon as the alarm activates.
    pub auto_start: bool,
    pub jpeg_quality: u8,
    pub upload_url: Option<String>,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            auto_start: true,
            jpeg_quality: 75,
            upload_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Alert backend; when unset alerts are only logged.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlarmConfig {
    pub cooldown_ms: u64,
    pub voice_alert: bool,
    pub voice_text: String,
    pub voice_pause_ms: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 10_000,
            voice_alert: true,
            voice_text: "Help! Help! Help!".into(),
            voice_pause_ms: 500,
        }
    }
}

impl AlarmConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "safeguard=info".into(),
            json: false,
        }
    }
}
