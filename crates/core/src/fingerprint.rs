//! Request fingerprinting
//!
//! A fingerprint is a SHA-256 digest over the model, the optional system
//! prompt and the prompt. It keys both the response cache and in-flight
//! coalescing, so a request that would hit the cache also joins an
//! identical request that is still executing.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 fingerprint of a normalized request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Each field is length-prefixed and separated so that ("ab", "c") and
// ("a", "bc") never hash the same.
fn update_field(hasher: &mut Sha256, tag: u8, value: &[u8]) {
    hasher.update([tag]);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
    hasher.update([0x1f]);
}

/// Compute the fingerprint of `(prompt, model, system_prompt)`
///
/// Pure and deterministic. `None` and `Some("")` system prompts produce
/// different fingerprints.
pub fn fingerprint(prompt: &str, model: &str, system_prompt: Option<&str>) -> Fingerprint {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, b'm', model.as_bytes());
    match system_prompt {
        Some(system) => update_field(&mut hasher, b's', system.as_bytes()),
        None => hasher.update([b'n', 0x1f]),
    }
    update_field(&mut hasher, b'p', prompt.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}
