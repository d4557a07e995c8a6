use std::time::Duration;
use thiserror::Error;

/// Why a single poll cycle did not produce a snapshot.
///
/// None of these reach HTTP handlers. They only decide how the poller logs
/// and whether the credential lifecycle gets involved.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("poll timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl PollError {
    /// Transient failures are retried on the next cycle with no other action.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PollError::Authentication(_))
    }
}

/// Startup configuration problems. Any of these keeps the server from binding.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown backend type {name:?}, available: {available}")]
    UnknownBackend { name: String, available: String },

    #[error("unknown frontend type {name:?}, available: {available}")]
    UnknownFrontend { name: String, available: String },

    #[error("phases must be 1 or 3, got {0}")]
    InvalidPhaseCount(u8),

    #[error("mac must be 12 hex characters, got {0:?}")]
    InvalidMac(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("environment variable {0:?} is not set")]
    MissingEnvVar(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_authentication_is_not_transient() {
        assert!(PollError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(PollError::MalformedResponse("x".into()).is_transient());
        assert!(PollError::HttpStatus(reqwest::StatusCode::BAD_GATEWAY).is_transient());
        assert!(!PollError::Authentication("401".into()).is_transient());
    }

    #[test]
    fn test_unknown_backend_message_lists_available() {
        let err = ConfigError::UnknownBackend {
            name: "solaredge".into(),
            available: "envoy".into(),
        };
        assert_eq!(
            err.to_string(),
            "unknown backend type \"solaredge\", available: envoy"
        );
    }
}
