//! Content fingerprints
//!
//! A fingerprint is the MD5 digest of a file's raw bytes. It is the
//! idempotency key for ingestion: byte-identical deliveries share one
//! fingerprint, any byte difference yields a different one.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a fingerprint rendered as lowercase hex
pub const FINGERPRINT_HEX_LEN: usize = 32;

/// 128-bit content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentFingerprint([u8; 16]);

impl ContentFingerprint {
    /// Digest raw content
    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Parse a 32 character hex string (case-insensitive)
    pub fn from_hex(value: &str) -> Result<Self> {
        let invalid = |reason: &str| CommonError::InvalidFingerprint {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.len() != FINGERPRINT_HEX_LEN {
            return Err(invalid("expected 32 hex characters"));
        }

        let mut bytes = [0u8; 16];
        hex::decode_to_slice(value, &mut bytes).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentFingerprint({})", self.to_hex())
    }
}

impl FromStr for ContentFingerprint {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for ContentFingerprint {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<ContentFingerprint> for String {
    fn from(fingerprint: ContentFingerprint) -> Self {
        fingerprint.to_hex()
    }
}
