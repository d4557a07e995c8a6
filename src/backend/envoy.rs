use chrono::{DateTime, Utc};
use serde_derive::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::{CloudCredentials, TokenManager};
use crate::config::EnvoyConfig;
use crate::error::{ConfigError, PollError};
use crate::meter_data::{MeterSnapshot, PhaseCount, PhaseReading};

const WH_PER_KWH: f64 = 1000.0;

/// Polls an Enphase Envoy gateway's `/production.json` for grid readings.
pub struct EnvoyBackend {
    endpoint_url: String,
    phases: PhaseCount,
    grid_frequency: f64,
    poll_interval: Duration,
    request_timeout: Duration,
    client: reqwest::Client,
    tokens: TokenManager,
}

impl EnvoyBackend {
    pub fn new(config: &EnvoyConfig, phases: PhaseCount) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(config.request_timeout())
            .build()?;
        let cloud = match (&config.username, &config.password, &config.serial) {
            (Some(username), Some(password), Some(serial)) => Some(CloudCredentials {
                username: username.clone(),
                password: password.clone(),
                serial: serial.clone(),
            }),
            _ => None,
        };
        let tokens = TokenManager::new(
            config.token.clone(),
            cloud,
            client.clone(),
            &config.enlighten_url,
            &config.entrez_url,
        );
        Ok(Self {
            endpoint_url: format!("{}/production.json?details=1", base_url(&config.host)),
            phases,
            grid_frequency: config.grid_frequency,
            poll_interval: config.poll_interval(),
            request_timeout: config.request_timeout(),
            client,
            tokens,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Fetches and normalizes one reading, refreshing the token at most once.
    pub async fn poll_once(&self) -> Result<MeterSnapshot, PollError> {
        let bearer = self.tokens.bearer().await?;
        let token = bearer.token;
        let body = match self.fetch(&token).await {
            Err(PollError::Authentication(reason)) if bearer.minted => {
                // Already refreshed this cycle; the next cycle mints again
                self.tokens.mark_expired(&token).await;
                return Err(PollError::Authentication(format!(
                    "{reason}; freshly issued token was rejected"
                )));
            }
            Err(PollError::Authentication(reason)) if self.tokens.can_refresh() => {
                warn!("Envoy rejected token ({reason}), refreshing and retrying once");
                let token = self.tokens.refresh(&token).await?;
                self.fetch(&token).await?
            }
            Err(PollError::Authentication(reason)) => {
                self.tokens.mark_expired(&token).await;
                return Err(PollError::Authentication(format!(
                    "{reason}; replace the token or configure Enlighten credentials"
                )));
            }
            other => other?,
        };
        let report: ProductionReport = serde_json::from_str(&body)
            .map_err(|e| PollError::MalformedResponse(format!("production.json: {e}")))?;
        let snapshot = parse_production(&report, self.phases, self.grid_frequency, Utc::now())?;
        debug!("Envoy poll OK: total_power={:.1} W", snapshot.total_act_power());
        Ok(snapshot)
    }

    async fn fetch(&self, token: &str) -> Result<String, PollError> {
        let response = self
            .client
            .get(&self.endpoint_url)
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PollError::Authentication(format!("Envoy returned {status}")));
        }
        if !status.is_success() {
            return Err(PollError::HttpStatus(status));
        }
        Ok(response.text().await?)
    }
}

/// Accepts either a bare host (HTTPS assumed) or a full base URL.
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
pub struct ProductionReport {
    #[serde(default)]
    pub production: Vec<Measurement>,
    #[serde(default)]
    pub consumption: Vec<Measurement>,
}

/// One measurement block (or one of its per-line entries) from the Envoy.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub measurement_type: Option<String>,
    #[serde(default)]
    pub w_now: f64,
    #[serde(default)]
    pub wh_lifetime: f64,
    #[serde(default)]
    pub rms_voltage: f64,
    #[serde(default)]
    pub rms_current: f64,
    #[serde(default)]
    pub apprnt_pwr: f64,
    #[serde(default)]
    pub pwr_factor: f64,
    #[serde(default)]
    pub lines: Vec<Measurement>,
}

fn find_measurement<'a>(entries: &'a [Measurement], wanted: &str) -> Option<&'a Measurement> {
    entries.iter().find(|entry| {
        entry.measurement_type.as_deref() == Some(wanted) || entry.kind.as_deref() == Some(wanted)
    })
}

fn lifetime_wh(measurement: Option<&Measurement>) -> f64 {
    measurement.map(|m| m.wh_lifetime).unwrap_or(0.0)
}

fn line(measurement: Option<&Measurement>, index: usize) -> Option<&Measurement> {
    measurement.and_then(|m| m.lines.get(index))
}

/// Exported energy is not reported directly; it is what was produced minus
/// what was consumed locally, offset by the net meter.
fn exported_wh(
    production: Option<&Measurement>,
    total_consumption: Option<&Measurement>,
    net_consumption: Option<&Measurement>,
) -> f64 {
    let exported = lifetime_wh(production) - lifetime_wh(total_consumption)
        + lifetime_wh(net_consumption);
    exported.max(0.0)
}

fn phase_reading(grid: &Measurement, exported_wh: f64, frequency: f64) -> PhaseReading {
    PhaseReading {
        voltage: grid.rms_voltage,
        current: grid.rms_current,
        act_power: grid.w_now,
        aprt_power: grid.apprnt_pwr,
        power_factor: grid.pwr_factor,
        frequency,
        energy_imported_kwh: grid.wh_lifetime / WH_PER_KWH,
        energy_exported_kwh: exported_wh / WH_PER_KWH,
    }
}

/// Maps a `/production.json?details=1` report onto the canonical model.
///
/// The grid reading comes from the `net-consumption` meter, falling back to
/// `total-consumption`. All unit conversion happens here.
pub fn parse_production(
    report: &ProductionReport,
    phases: PhaseCount,
    grid_frequency: f64,
    captured_at: DateTime<Utc>,
) -> Result<MeterSnapshot, PollError> {
    let total_consumption = find_measurement(&report.consumption, "total-consumption");
    let net_consumption = find_measurement(&report.consumption, "net-consumption");
    let inverters = find_measurement(&report.production, "inverters");

    let grid = net_consumption.or(total_consumption).ok_or_else(|| {
        PollError::MalformedResponse(
            "no net-consumption or total-consumption measurement in response".to_string(),
        )
    })?;

    let readings = match phases {
        PhaseCount::Single => vec![phase_reading(
            grid,
            exported_wh(inverters, total_consumption, net_consumption),
            grid_frequency,
        )],
        PhaseCount::Three => {
            if grid.lines.len() < 3 {
                return Err(PollError::MalformedResponse(format!(
                    "configured for 3 phases but grid measurement has {} lines",
                    grid.lines.len()
                )));
            }
            grid.lines
                .iter()
                .take(3)
                .enumerate()
                .map(|(i, grid_line)| {
                    let exported = exported_wh(
                        line(inverters, i),
                        line(total_consumption, i),
                        line(net_consumption, i),
                    );
                    phase_reading(grid_line, exported, grid_frequency)
                })
                .collect()
        }
    };

    Ok(MeterSnapshot::new(readings, captured_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::credentials::{test_jwt, CredentialState};
    use crate::config::{DEFAULT_ENLIGHTEN_URL, DEFAULT_ENTREZ_URL};
    use mockito::Matcher;

    const SINGLE_PHASE: &str = r#"{
        "production": [
            {"type": "inverters", "activeCount": 10, "readingTime": 1700000000,
             "wNow": 2500.0, "whLifetime": 50000.0},
            {"type": "eim", "activeCount": 1, "measurementType": "production",
             "readingTime": 1700000000, "wNow": 2480.0, "whLifetime": 49000.0,
             "rmsVoltage": 231.5, "rmsCurrent": 10.7, "apprntPwr": 2490.0, "pwrFactor": 0.99}
        ],
        "consumption": [
            {"type": "eim", "activeCount": 1, "measurementType": "total-consumption",
             "readingTime": 1700000000, "wNow": 3000.0, "whLifetime": 80000.0,
             "rmsVoltage": 231.5, "rmsCurrent": 13.0, "apprntPwr": 3010.0, "pwrFactor": 0.99},
            {"type": "eim", "activeCount": 1, "measurementType": "net-consumption",
             "readingTime": 1700000000, "wNow": 520.0, "whLifetime": 35000.0,
             "rmsVoltage": 231.0, "rmsCurrent": 2.3, "apprntPwr": 530.0, "pwrFactor": 0.98}
        ]
    }"#;

    const THREE_PHASE: &str = r#"{
        "production": [
            {"type": "inverters", "wNow": 5000.0, "whLifetime": 100000.0,
             "lines": [
                {"wNow": 1700.0, "whLifetime": 34000.0},
                {"wNow": 1700.0, "whLifetime": 33000.0},
                {"wNow": 1600.0, "whLifetime": 33000.0}
             ]}
        ],
        "consumption": [
            {"type": "eim", "measurementType": "total-consumption", "wNow": 6000.0,
             "whLifetime": 150000.0,
             "lines": [
                {"wNow": 2000.0, "whLifetime": 50000.0},
                {"wNow": 2200.0, "whLifetime": 52000.0},
                {"wNow": 1800.0, "whLifetime": 48000.0}
             ]},
            {"type": "eim", "measurementType": "net-consumption", "wNow": 1000.0,
             "whLifetime": 60000.0,
             "lines": [
                {"wNow": 300.0, "whLifetime": 20000.0, "rmsVoltage": 230.0,
                 "rmsCurrent": 1.3, "apprntPwr": 300.0, "pwrFactor": 1.0},
                {"wNow": 500.0, "whLifetime": 22000.0, "rmsVoltage": 231.0,
                 "rmsCurrent": 2.2, "apprntPwr": 500.0, "pwrFactor": 1.0},
                {"wNow": 200.0, "whLifetime": 18000.0, "rmsVoltage": 229.0,
                 "rmsCurrent": 0.9, "apprntPwr": 200.0, "pwrFactor": 1.0}
             ]}
        ]
    }"#;

    fn parse(json: &str, phases: PhaseCount) -> Result<MeterSnapshot, PollError> {
        let report: ProductionReport = serde_json::from_str(json).unwrap();
        parse_production(&report, phases, 50.0, Utc::now())
    }

    #[test]
    fn test_parse_single_phase() {
        let snapshot = parse(SINGLE_PHASE, PhaseCount::Single).unwrap();
        assert_eq!(snapshot.phases().len(), 1);

        // Values come from net-consumption
        let phase = &snapshot.phases()[0];
        assert_eq!(phase.act_power, 520.0);
        assert_eq!(phase.voltage, 231.0);
        assert_eq!(phase.current, 2.3);
        assert_eq!(phase.aprt_power, 530.0);
        assert_eq!(phase.power_factor, 0.98);
        assert_eq!(phase.frequency, 50.0);
        assert_eq!(phase.energy_imported_kwh, 35.0);
        // production(50000) - total_consumption(80000) + net_consumption(35000) = 5000 Wh
        assert_eq!(phase.energy_exported_kwh, 5.0);

        assert_eq!(snapshot.total_act_power(), 520.0);
        assert_eq!(snapshot.total_current(), 2.3);
    }

    #[test]
    fn test_parse_negative_power_is_export() {
        let json = r#"{
            "production": [{"type": "inverters", "wNow": 3000.0, "whLifetime": 50000.0}],
            "consumption": [
                {"measurementType": "total-consumption", "wNow": 1000.0, "whLifetime": 80000.0},
                {"measurementType": "net-consumption", "wNow": -2000.0, "whLifetime": 10000.0,
                 "rmsVoltage": 230.0, "rmsCurrent": 8.7, "apprntPwr": 2000.0, "pwrFactor": -1.0}
            ]
        }"#;
        let snapshot = parse(json, PhaseCount::Single).unwrap();
        assert_eq!(snapshot.phases()[0].act_power, -2000.0);
        assert_eq!(snapshot.total_act_power(), -2000.0);
        // 50000 - 80000 + 10000 is negative, clamped to zero
        assert_eq!(snapshot.energy_exported_kwh(), 0.0);
    }

    #[test]
    fn test_parse_empty_response_is_malformed() {
        assert!(matches!(
            parse("{}", PhaseCount::Single),
            Err(PollError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_falls_back_to_total_consumption() {
        let json = r#"{
            "production": [{"type": "inverters", "wNow": 1000.0, "whLifetime": 10000.0}],
            "consumption": [
                {"measurementType": "total-consumption", "wNow": 1500.0, "whLifetime": 20000.0,
                 "rmsVoltage": 230.0, "rmsCurrent": 6.5, "apprntPwr": 1500.0, "pwrFactor": 1.0}
            ]
        }"#;
        let snapshot = parse(json, PhaseCount::Single).unwrap();
        assert_eq!(snapshot.phases()[0].act_power, 1500.0);
        assert_eq!(snapshot.total_act_power(), 1500.0);
    }

    #[test]
    fn test_parse_three_phase() {
        let snapshot = parse(THREE_PHASE, PhaseCount::Three).unwrap();
        let phases = snapshot.phases();
        assert_eq!(phases.len(), 3);

        assert_eq!(phases[0].act_power, 300.0);
        assert_eq!(phases[0].voltage, 230.0);
        assert_eq!(phases[0].current, 1.3);
        assert_eq!(phases[0].energy_imported_kwh, 20.0);
        // prod(34000) - cons(50000) + net(20000) = 4000 Wh
        assert_eq!(phases[0].energy_exported_kwh, 4.0);
        assert_eq!(phases[1].act_power, 500.0);
        assert_eq!(phases[1].energy_exported_kwh, 3.0);
        assert_eq!(phases[2].voltage, 229.0);
        assert_eq!(phases[2].energy_exported_kwh, 3.0);

        assert_eq!(snapshot.total_act_power(), 1000.0);
        assert!((snapshot.total_current() - 4.4).abs() < 0.01);
        assert!((snapshot.energy_imported_kwh() - 60.0).abs() < 1e-9);
        assert!((snapshot.energy_exported_kwh() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_three_phase_without_lines_is_malformed() {
        assert!(matches!(
            parse(SINGLE_PHASE, PhaseCount::Three),
            Err(PollError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("192.168.1.10"), "https://192.168.1.10");
        assert_eq!(base_url("http://127.0.0.1:1234/"), "http://127.0.0.1:1234");
    }

    fn config(host: String, token: Option<&str>, with_cloud: bool, cloud_url: &str) -> EnvoyConfig {
        let (enlighten_url, entrez_url) = if with_cloud {
            (cloud_url.to_string(), cloud_url.to_string())
        } else {
            (DEFAULT_ENLIGHTEN_URL.to_string(), DEFAULT_ENTREZ_URL.to_string())
        };
        EnvoyConfig {
            host,
            token: token.map(String::from),
            username: with_cloud.then(|| "user@example.com".to_string()),
            password: with_cloud.then(|| "pass".to_string()),
            serial: with_cloud.then(|| "122212345678".to_string()),
            poll_interval: 2.0,
            timeout: 5.0,
            verify_ssl: false,
            grid_frequency: 60.0,
            enlighten_url,
            entrez_url,
        }
    }

    #[tokio::test]
    async fn test_poll_once_with_static_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/production.json")
            .match_query(Matcher::UrlEncoded("details".into(), "1".into()))
            .match_header("Authorization", "Bearer static-jwt")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(SINGLE_PHASE)
            .create_async()
            .await;

        let backend = EnvoyBackend::new(
            &config(server.url(), Some("static-jwt"), false, ""),
            PhaseCount::Single,
        )
        .unwrap();
        let snapshot = backend.poll_once().await.unwrap();
        assert_eq!(snapshot.total_act_power(), 520.0);
        assert_eq!(snapshot.phases()[0].frequency, 60.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_refreshes_token_on_401() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .match_header("Authorization", "Bearer old-jwt")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let login = server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"session_id":"session-1"}"#)
            .expect(1)
            .create_async()
            .await;
        let tokens = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body("new-jwt")
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .match_header("Authorization", "Bearer new-jwt")
            .with_status(200)
            .with_body(SINGLE_PHASE)
            .expect(1)
            .create_async()
            .await;

        let url = server.url();
        let backend =
            EnvoyBackend::new(&config(url.clone(), Some("old-jwt"), true, &url), PhaseCount::Single)
                .unwrap();
        let snapshot = backend.poll_once().await.unwrap();

        assert_eq!(snapshot.total_act_power(), 520.0);
        assert!(matches!(
            backend.tokens().state().await,
            CredentialState::Valid { ref token, .. } if token == "new-jwt"
        ));
        rejected.assert_async().await;
        login.assert_async().await;
        tokens.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_refreshes_at_most_once_per_cycle() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"session_id":"s"}"#)
            .create_async()
            .await;
        let tokens = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body("new-jwt")
            .expect(1)
            .create_async()
            .await;

        let url = server.url();
        let backend =
            EnvoyBackend::new(&config(url.clone(), Some("old-jwt"), true, &url), PhaseCount::Single)
                .unwrap();
        let result = backend.poll_once().await;

        assert!(matches!(result, Err(PollError::Authentication(_))));
        tokens.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_jwt_is_minted_once_even_when_rejected() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"session_id":"s"}"#)
            .create_async()
            .await;
        let tokens = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body(test_jwt(Utc::now().timestamp() + 86_400))
            .expect(1)
            .create_async()
            .await;

        let url = server.url();
        let expired = test_jwt(Utc::now().timestamp() - 10);
        let backend =
            EnvoyBackend::new(&config(url.clone(), Some(&expired), true, &url), PhaseCount::Single)
                .unwrap();
        let err = backend.poll_once().await.unwrap_err();

        assert!(matches!(err, PollError::Authentication(_)));
        assert!(matches!(backend.tokens().state().await, CredentialState::Expired { .. }));
        rejected.assert_async().await;
        tokens.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_no_refresh_on_401_without_credentials() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let backend = EnvoyBackend::new(
            &config(server.url(), Some("static-jwt"), false, ""),
            PhaseCount::Single,
        )
        .unwrap();
        let result = backend.poll_once().await;

        assert!(matches!(result, Err(PollError::Authentication(_))));
        assert_eq!(
            backend.tokens().state().await,
            CredentialState::Expired {
                token: "static-jwt".into()
            }
        );
    }

    #[tokio::test]
    async fn test_poll_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let backend = EnvoyBackend::new(
            &config(server.url(), Some("static-jwt"), false, ""),
            PhaseCount::Single,
        )
        .unwrap();
        let err = backend.poll_once().await.unwrap_err();
        assert!(matches!(err, PollError::HttpStatus(s) if s.as_u16() == 503));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_poll_garbage_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/production.json")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let backend = EnvoyBackend::new(
            &config(server.url(), Some("static-jwt"), false, ""),
            PhaseCount::Single,
        )
        .unwrap();
        assert!(matches!(
            backend.poll_once().await,
            Err(PollError::MalformedResponse(_))
        ));
    }
}
