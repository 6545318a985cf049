use crate::providers::RandomProvider;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token identifying one session of a persistent port.
///
/// A fresh fingerprint is minted on every (re)connect so the relay can tell a
/// stale session apart from a newer one sharing the same endpoint id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Mint a new random fingerprint of the form `uid::xxxxxxx`.
    pub fn mint(random: &impl RandomProvider) -> Self {
        Fingerprint(format!("uid::{}", random.random_id(7)))
    }

    /// Wrap an existing token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Fingerprint(token.into())
    }

    /// The token as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
