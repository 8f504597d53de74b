//! safeguard: personal-safety alarm engine.
//! Arms on request, fuses manual/shake/keyword triggers, then locates, alerts,
//! enriches and records evidence, tolerating every failure along the way.

pub mod cancellation;
pub mod clock;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod evidence;
pub mod geo;
pub mod location;
pub mod metrics;
pub mod pipeline;
pub mod state_machine;
pub mod trigger;
pub mod voice_alarm;

use tracing_subscriber::EnvFilter;

pub use config::{EngineConfig, LoggingConfig};
pub use engine::{AlarmEngine, Devices, Services};
pub use error::{AlertError, ConfigError, DeviceError, NetworkError};
pub use events::EngineEvent;
pub use location::LocationSample;
pub use state_machine::{AlarmSession, AlarmState, TriggerSource};

/// Install the global tracing subscriber. `RUST_LOG` wins over
/// `config.filter`. Returns false if a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("safeguard=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::info!(json = config.json, "tracing initialized");
    }
    installed
}
