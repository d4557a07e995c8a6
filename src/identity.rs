use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Hardware address presented to clients, stored as 12 upper-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAddress(String);

impl MacAddress {
    /// Derives a stable address from the host name, so restarts do not leave
    /// orphaned discovery entries behind.
    pub fn from_hostname() -> Self {
        let hostname = gethostname::gethostname();
        Self::from_seed(hostname.to_string_lossy().as_bytes())
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = Sha256::digest(seed);
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&digest[..6]);
        // Locally administered, unicast
        bytes[0] = (bytes[0] | 0x02) & 0xFE;
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_lowercase(&self) -> String {
        self.0.to_lowercase()
    }
}

impl FromStr for MacAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect::<String>()
            .to_uppercase();
        if normalized.len() != 12 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidMac(s.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static identity of the emulated device. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub mac: MacAddress,
    pub device_id: String,
    pub name: String,
    pub model: String,
    pub gen: u8,
    pub fw_id: String,
    pub version: String,
    pub app: String,
    pub profile: String,
}
