//! Peer identity abstraction
//!
//! The call core never looks inside an identity; it only needs to display it,
//! compare it and carry it through events. Chat front-ends plug in their own
//! user handle type by implementing [`PeerIdentity`].

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identity of the remote party of a call
pub trait PeerIdentity:
    Clone + Debug + Display + PartialEq + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to a string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Single character shown in place of an avatar
    fn initial(&self) -> char {
        self.to_string_repr()
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or('?')
    }
}

/// Display-name based peer identity
///
/// Matches how the chat directory names friends. Good enough for the
/// simulated signaling path and for tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("peer identity cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
