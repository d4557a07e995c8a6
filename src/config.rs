use regex::Regex;
use serde_derive::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::meter_data::PhaseCount;

pub const DEFAULT_ENLIGHTEN_URL: &str = "https://enlighten.enphaseenergy.com";
pub const DEFAULT_ENTREZ_URL: &str = "https://entrez.enphaseenergy.com";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    #[serde(rename = "type", default = "default_frontend_type")]
    pub kind: String,
    #[serde(default)]
    pub shelly: ShellyConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            kind: default_frontend_type(),
            shelly: ShellyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellyConfig {
    /// Generated from the host name when absent.
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub phases: PhaseCount,
    #[serde(default = "default_true")]
    pub mdns: bool,
}

impl Default for ShellyConfig {
    fn default() -> Self {
        Self {
            mac: None,
            phases: PhaseCount::default(),
            mdns: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type", default = "default_backend_type")]
    pub kind: String,
    #[serde(default)]
    pub envoy: Option<EnvoyConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_type(),
            envoy: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvoyConfig {
    pub host: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    /// Seconds between polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default = "default_grid_frequency")]
    pub grid_frequency: f64,
    #[serde(default = "default_enlighten_url")]
    pub enlighten_url: String,
    #[serde(default = "default_entrez_url")]
    pub entrez_url: String,
}

/// Shortest accepted poll interval or request timeout.
pub const MIN_DURATION: Duration = Duration::from_millis(1);
/// Longest accepted poll interval or request timeout.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

impl EnvoyConfig {
    pub fn poll_interval(&self) -> Duration {
        bounded_seconds(self.poll_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        bounded_seconds(self.timeout)
    }

    /// Checks the fields serde cannot: duration bounds, a usable token and
    /// the all-or-nothing cloud credential triple.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("backend.envoy.host"));
        }
        check_seconds("backend.envoy.poll_interval", self.poll_interval)?;
        check_seconds("backend.envoy.timeout", self.timeout)?;
        let cloud_fields = [&self.username, &self.password, &self.serial];
        let present = cloud_fields.iter().filter(|f| f.is_some()).count();
        if present != 0 && present != cloud_fields.len() {
            let missing = if self.username.is_none() {
                "backend.envoy.username"
            } else if self.password.is_none() {
                "backend.envoy.password"
            } else {
                "backend.envoy.serial"
            };
            return Err(ConfigError::MissingField(missing));
        }
        if present == 0 {
            match &self.token {
                None => return Err(ConfigError::MissingField("backend.envoy.token")),
                Some(token) if token.trim().is_empty() => {
                    return Err(ConfigError::InvalidValue {
                        field: "backend.envoy.token",
                        reason: "must not be empty without cloud credentials".to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn check_seconds(field: &'static str, seconds: f64) -> Result<(), ConfigError> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if (MIN_DURATION..=MAX_DURATION).contains(&duration) => Ok(()),
        _ => Err(ConfigError::InvalidValue {
            field,
            reason: format!(
                "must be between {} and {} seconds, got {seconds}",
                MIN_DURATION.as_secs_f64(),
                MAX_DURATION.as_secs_f64()
            ),
        }),
    }
}

/// Clamps to the accepted range; NaN maps to the minimum.
fn bounded_seconds(seconds: f64) -> Duration {
    if seconds >= MAX_DURATION.as_secs_f64() {
        MAX_DURATION
    } else if seconds >= MIN_DURATION.as_secs_f64() {
        Duration::from_secs_f64(seconds)
    } else {
        MIN_DURATION
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

fn default_frontend_type() -> String {
    "shelly".to_string()
}

fn default_backend_type() -> String {
    "envoy".to_string()
}

fn default_poll_interval() -> f64 {
    2.0
}

fn default_timeout() -> f64 {
    10.0
}

fn default_grid_frequency() -> f64 {
    50.0
}

fn default_enlighten_url() -> String {
    DEFAULT_ENLIGHTEN_URL.to_string()
}

fn default_entrez_url() -> String {
    DEFAULT_ENTREZ_URL.to_string()
}

impl AppConfig {
    /// Loads configuration from a YAML file with `${VAR}` substitution.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut document: serde_yaml::Value = serde_yaml::from_str(content)?;
        // An empty document means "all defaults"
        if document.is_null() {
            return Ok(Self::default());
        }
        substitute_env_vars(&mut document)?;
        let config: AppConfig = serde_yaml::from_value(document)?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Substitutes `${VAR_NAME}` inside string values of the parsed document.
///
/// Keys and comments are left alone, and substituted text is never re-parsed
/// as YAML.
fn substitute_env_vars(document: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::InvalidValue {
        field: "env substitution pattern",
        reason: e.to_string(),
    })?;
    substitute_in_value(&re, document)
}

fn substitute_in_value(re: &Regex, value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(text) => {
            if re.is_match(text) {
                *text = substitute_in_str(re, text)?;
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                substitute_in_value(re, item)?;
            }
        }
        serde_yaml::Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                substitute_in_value(re, item)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => substitute_in_value(re, &mut tagged.value)?,
        _ => {}
    }
    Ok(())
}

fn substitute_in_str(re: &Regex, text: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for cap in re.captures_iter(text) {
        let Some(whole) = cap.get(0) else { continue };
        let var_name = &cap[1];
        let value =
            env::var(var_name).map_err(|_| ConfigError::MissingEnvVar(var_name.to_string()))?;
        result.push_str(&text[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&text[last..]);
    Ok(result)
}
