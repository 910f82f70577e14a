pub mod config;
pub mod error;
pub mod types;

pub use config::{bank, control, payment, routing, wallet, ConfigError, NodeConfig};
pub use error::{BitmeshError, Result};
pub use types::{Bandwidth, Timestamp};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidFingerprint { expected: usize, actual: usize },
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprintHex(String),
}

/// Relay identity fingerprint (SHA-1 sized, shown as 40 upper-case hex chars)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, DomainError> {
        if bytes.len() != FINGERPRINT_LEN {
            return Err(DomainError::InvalidFingerprint {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; FINGERPRINT_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, DomainError> {
        let decoded = hex::decode(hex_str)
            .map_err(|err| DomainError::InvalidFingerprintHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// Parse the long relay names used in events: `$HEX~nick`, `$HEX=nick`,
    /// `$HEX` or bare `HEX`.
    pub fn from_long_name(name: &str) -> std::result::Result<Self, DomainError> {
        let name = name.strip_prefix('$').unwrap_or(name);
        let hex_part = name.split(|c| c == '~' || c == '=').next().unwrap_or(name);
        Self::from_hex(hex_part)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(value: [u8; FINGERPRINT_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_rejects_wrong_length() {
        let err = Fingerprint::try_from(&[1u8; 16][..]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidFingerprint { .. }));
    }

    #[test]
    fn fingerprint_parses_hex_roundtrip() {
        let hex_id = "AB".repeat(FINGERPRINT_LEN);
        let parsed = Fingerprint::from_hex(&hex_id).expect("should parse valid hex");
        assert_eq!(parsed.to_string(), hex_id);
    }

    #[test]
    fn fingerprint_accepts_lowercase() {
        let parsed = Fingerprint::from_hex(&"0f".repeat(FINGERPRINT_LEN)).unwrap();
        assert_eq!(parsed.to_hex(), "0F".repeat(FINGERPRINT_LEN));
    }

    #[test]
    fn fingerprint_parses_long_names() {
        let hex_id = "12".repeat(FINGERPRINT_LEN);
        let expected = Fingerprint::from_hex(&hex_id).unwrap();
        assert_eq!(Fingerprint::from_long_name(&format!("${}~relay", hex_id)).unwrap(), expected);
        assert_eq!(Fingerprint::from_long_name(&format!("${}=relay", hex_id)).unwrap(), expected);
        assert_eq!(Fingerprint::from_long_name(&format!("${}", hex_id)).unwrap(), expected);
        assert!(Fingerprint::from_long_name("$nothex~relay").is_err());
    }

    #[test]
    fn fingerprint_serializes() {
        let fp = Fingerprint::from([7u8; FINGERPRINT_LEN]);
        let encoded = bincode::serialize(&fp).unwrap();
        let decoded: Fingerprint = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, fp);
    }
}
