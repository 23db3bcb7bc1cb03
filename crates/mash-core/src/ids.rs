//! Zone-ID derivation (spec.md §3 "Zone", §4.5.5, Property P3).
//!
//! `zone_id = hex(SHA-256(session_key)[:8])`, a fixed 16-char lowercase hex
//! string. Identical on both sides of the handshake; changing this breaks
//! interop with the device.

use sha2::{Digest, Sha256};
use std::fmt;

/// A 16-lowercase-hex-char zone identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId(String);

impl ZoneId {
    /// Derives a zone ID from a 32-byte PASE session key.
    pub fn derive(session_key: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_key);
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    /// Parses a previously-derived zone ID, validating its shape.
    ///
    /// Returns `None` if `s` isn't exactly 16 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
