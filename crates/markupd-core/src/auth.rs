//! Connection token validation
//!
//! Pairing happens elsewhere; the server only asks whether a presented token
//! is acceptable.

use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Decides whether a connection token is valid
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// A single shared secret
pub struct SharedToken {
    digest: [u8; 32],
}

impl SharedToken {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            digest: digest(token.as_ref()),
        }
    }
}

impl std::fmt::Debug for SharedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedToken(..)")
    }
}

impl TokenValidator for SharedToken {
    fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        // Fixed-length digests compared without early exit
        digest(token)
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

/// Accepts every token. For local development and tests.
#[derive(Debug, Default)]
pub struct AllowAll;

impl TokenValidator for AllowAll {
    fn validate(&self, _token: &str) -> bool {
        true
    }
}

/// Extract and percent-decode the `token` query parameter.
///
/// A value that does not decode to UTF-8 counts as absent.
pub fn token_from_query(query: Option<&str>) -> Option<Cow<'_, str>> {
    let raw = query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value)?;
    urlencoding::decode(raw).ok()
}
