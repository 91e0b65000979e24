use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relay-level address of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PeerId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Identity of this running client. Generated fresh on every start and
/// never persisted.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    id: PeerId,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            id: PeerId(Uuid::new_v4().to_string()),
        }
    }

    /// Fixed identity, for tests and tooling that need a predictable address.
    pub fn with_id(id: impl Into<PeerId>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }
}
