//! Salted one-way fingerprints for anything that would otherwise be PII.

use sha2::{Digest as _, Sha256};

/// Deployment-wide digest helper. The salt is fixed for the lifetime of a
/// deployment, so the same IP hashes to the same fingerprint across
/// restarts; fingerprints are not comparable across deployments.
#[derive(Clone)]
pub struct Digester {
    salt: String,
}

impl Digester {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// 64-lowercase-hex SHA-256 over `salt || input`. Absent or empty input
    /// returns `None` rather than the hash of the empty string, so absence
    /// stays distinguishable from presence downstream.
    pub fn digest(&self, input: Option<&str>) -> Option<String> {
        let input = input?;
        if input.is_empty() {
            return None;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(input.as_bytes());
        Some(hex_lower(&hasher.finalize()))
    }
}

impl std::fmt::Debug for Digester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digester")
            .field("salt", &"<redacted>")
            .finish()
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}
