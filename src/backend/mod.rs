//! Meter data sources. Each variant polls one vendor API and normalizes the
//! result into a [`MeterSnapshot`](crate::meter_data::MeterSnapshot).

pub mod credentials;
pub mod envoy;

use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::{ConfigError, PollError};
use crate::meter_data::{MeterSnapshot, PhaseCount};

pub use envoy::EnvoyBackend;

/// Backend type names accepted in configuration.
pub const BACKEND_TYPES: &[&str] = &["envoy"];

pub enum Backend {
    Envoy(EnvoyBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Envoy(_) => "envoy",
        }
    }

    pub fn poll_interval(&self) -> Duration {
        match self {
            Backend::Envoy(backend) => backend.poll_interval(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        match self {
            Backend::Envoy(backend) => backend.request_timeout(),
        }
    }

    pub async fn poll_once(&self) -> Result<MeterSnapshot, PollError> {
        match self {
            Backend::Envoy(backend) => backend.poll_once().await,
        }
    }
}

/// Builds the backend named by `config.kind`.
pub fn create_backend(config: &BackendConfig, phases: PhaseCount) -> Result<Backend, ConfigError> {
    match config.kind.as_str() {
        "envoy" => {
            let envoy = config
                .envoy
                .as_ref()
                .ok_or(ConfigError::MissingField("backend.envoy"))?;
            Ok(Backend::Envoy(EnvoyBackend::new(envoy, phases)?))
        }
        other => Err(ConfigError::UnknownBackend {
            name: other.to_string(),
            available: BACKEND_TYPES.join(", "),
        }),
    }
}
