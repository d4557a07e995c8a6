//! Emulated meter devices that serve the shared snapshot to consumers.

pub mod shelly;

use axum::Router;

use crate::config::FrontendConfig;
use crate::error::ConfigError;
use crate::snapshot_store::SnapshotStore;

pub use shelly::ShellyFrontend;

/// Frontend type names accepted in configuration.
pub const FRONTEND_TYPES: &[&str] = &["shelly"];

pub enum Frontend {
    Shelly(ShellyFrontend),
}

impl Frontend {
    pub fn name(&self) -> &'static str {
        match self {
            Frontend::Shelly(_) => "shelly",
        }
    }

    pub fn router(&self) -> Router {
        match self {
            Frontend::Shelly(frontend) => frontend.router(),
        }
    }

    /// Called once the HTTP listener is bound to `port`.
    pub fn start(&mut self, port: u16) {
        match self {
            Frontend::Shelly(frontend) => frontend.start(port),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Frontend::Shelly(frontend) => frontend.stop(),
        }
    }
}

pub fn create_frontend(
    config: &FrontendConfig,
    store: SnapshotStore,
) -> Result<Frontend, ConfigError> {
    match config.kind.as_str() {
        "shelly" => Ok(Frontend::Shelly(ShellyFrontend::new(&config.shelly, store)?)),
        other => Err(ConfigError::UnknownFrontend {
            name: other.to_string(),
            available: FRONTEND_TYPES.join(", "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::meter_data::PhaseCount;
    use std::time::Duration;

    fn store() -> SnapshotStore {
        SnapshotStore::new(PhaseCount::Single, Duration::from_secs(30))
    }

    #[test]
    fn test_create_shelly_frontend() {
        let config = AppConfig::from_yaml(
            r#"
frontend:
  type: shelly
  shelly:
    mac: "aa:bb:cc:dd:ee:ff"
    mdns: false
"#,
        )
        .unwrap();
        let frontend = create_frontend(&config.frontend, store()).unwrap();
        assert_eq!(frontend.name(), "shelly");
        let Frontend::Shelly(shelly) = frontend;
        assert_eq!(shelly.identity().mac.as_str(), "AABBCCDDEEFF");
    }

    #[test]
    fn test_unknown_frontend_fails_fast() {
        let config = AppConfig::from_yaml("frontend:\n  type: fronius\n").unwrap();
        assert!(matches!(
            create_frontend(&config.frontend, store()),
            Err(ConfigError::UnknownFrontend { ref name, .. }) if name == "fronius"
        ));
    }
}
