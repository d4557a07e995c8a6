use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PollError;

/// Tokens this close to expiry are renewed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Enlighten account credentials able to mint new device tokens.
#[derive(Debug, Clone)]
pub struct CloudCredentials {
    pub username: String,
    pub password: String,
    pub serial: String,
}

/// Where the device token currently stands.
///
/// Refreshing happens while the state mutex is held, so it is not a separate
/// variant: any caller that observes the state sees either the old or the new
/// token.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialState {
    NoCredential,
    Valid {
        token: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Expired {
        token: String,
    },
}

impl CredentialState {
    fn from_token(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.trim().is_empty() => {
                let expires_at = token_expiry(&token);
                CredentialState::Valid { token, expires_at }
            }
            _ => CredentialState::NoCredential,
        }
    }

    fn token(&self) -> Option<&str> {
        match self {
            CredentialState::NoCredential => None,
            CredentialState::Valid { token, .. } | CredentialState::Expired { token } => {
                Some(token)
            }
        }
    }

    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        match self {
            CredentialState::Valid {
                expires_at: Some(expires_at),
                ..
            } => *expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now,
            CredentialState::Valid { expires_at: None, .. } => true,
            _ => false,
        }
    }
}

/// Token handed out by [`TokenManager::bearer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Bearer {
    pub token: String,
    /// True when this call had to mint the token through the cloud.
    pub minted: bool,
}

impl Bearer {
    fn existing(token: String) -> Self {
        Self {
            token,
            minted: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    session_id: &'a str,
    serial: &'a str,
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Owns the bearer token used against the Envoy and renews it through the
/// Enlighten cloud when account credentials are configured.
pub struct TokenManager {
    state: Mutex<CredentialState>,
    cloud: Option<CloudCredentials>,
    client: reqwest::Client,
    enlighten_url: String,
    entrez_url: String,
}

impl TokenManager {
    pub fn new(
        token: Option<String>,
        cloud: Option<CloudCredentials>,
        client: reqwest::Client,
        enlighten_url: &str,
        entrez_url: &str,
    ) -> Self {
        Self {
            state: Mutex::new(CredentialState::from_token(token)),
            cloud,
            client,
            enlighten_url: enlighten_url.trim_end_matches('/').to_string(),
            entrez_url: entrez_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.cloud.is_some()
    }

    pub async fn state(&self) -> CredentialState {
        self.state.lock().await.clone()
    }

    /// Returns a token to use for the next request, minting one first when
    /// the current token is missing or about to expire and that is possible.
    pub async fn bearer(&self) -> Result<Bearer, PollError> {
        let mut state = self.state.lock().await;
        if state.is_usable(Utc::now()) {
            if let Some(token) = state.token() {
                return Ok(Bearer::existing(token.to_string()));
            }
        }
        let current = state.token().map(str::to_string);
        match (&self.cloud, current) {
            (Some(cloud), _) => {
                info!("Envoy token missing or expiring, requesting a new one");
                let token = self.mint(cloud).await?;
                *state = CredentialState::from_token(Some(token.clone()));
                Ok(Bearer {
                    token,
                    minted: true,
                })
            }
            // Without cloud credentials a stale token is still worth trying.
            (None, Some(token)) => Ok(Bearer::existing(token)),
            (None, None) => Err(PollError::Authentication(
                "no token and no cloud credentials configured".to_string(),
            )),
        }
    }

    /// Replaces `rejected` with a freshly minted token.
    ///
    /// Only one refresh runs at a time. A caller that arrives after someone
    /// else already replaced `rejected` gets the new token without another
    /// round trip to the cloud.
    pub async fn refresh(&self, rejected: &str) -> Result<String, PollError> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.token() {
            if current != rejected && state.is_usable(Utc::now()) {
                return Ok(current.to_string());
            }
        }
        let Some(cloud) = &self.cloud else {
            *state = CredentialState::Expired {
                token: rejected.to_string(),
            };
            return Err(PollError::Authentication(
                "token rejected and no cloud credentials configured".to_string(),
            ));
        };
        let token = self.mint(cloud).await?;
        *state = CredentialState::from_token(Some(token.clone()));
        info!("Envoy token refreshed");
        Ok(token)
    }

    /// Marks `rejected` as expired if it is still the current token.
    pub async fn mark_expired(&self, rejected: &str) {
        let mut state = self.state.lock().await;
        if state.token() == Some(rejected) {
            *state = CredentialState::Expired {
                token: rejected.to_string(),
            };
        }
    }

    /// Two-step Enlighten flow: account login for a session id, then a
    /// device-scoped token for the gateway serial.
    async fn mint(&self, cloud: &CloudCredentials) -> Result<String, PollError> {
        let response = self
            .client
            .post(format!("{}/login/login.json", self.enlighten_url))
            .form(&[
                ("user[email]", cloud.username.as_str()),
                ("user[password]", cloud.password.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PollError::Authentication(format!(
                "Enlighten login rejected with {status}"
            )));
        }
        if !status.is_success() {
            return Err(PollError::HttpStatus(status));
        }
        let body = response.text().await?;
        let login: LoginResponse = serde_json::from_str(&body).map_err(|e| {
            PollError::MalformedResponse(format!("Enlighten login response: {e}"))
        })?;

        let response = self
            .client
            .post(format!("{}/tokens", self.entrez_url))
            .json(&TokenRequest {
                session_id: &login.session_id,
                serial: &cloud.serial,
                username: &cloud.username,
            })
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PollError::Authentication(format!(
                "token request for serial {} rejected with {status}",
                cloud.serial
            )));
        }
        if !status.is_success() {
            return Err(PollError::HttpStatus(status));
        }
        let token = response.text().await?.trim().to_string();
        if token.is_empty() {
            return Err(PollError::MalformedResponse(
                "token endpoint returned an empty body".to_string(),
            ));
        }
        if token_expiry(&token).is_none() {
            warn!("New Envoy token has no readable expiry; it will be renewed only on rejection");
        }
        Ok(token)
    }
}

/// Reads the `exp` claim of a JWT without verifying it.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

#[cfg(test)]
pub(crate) fn test_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"aud":"122212345678","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
