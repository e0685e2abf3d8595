use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

/// Opaque identifier of a stored embedding record (a ULID string).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct RecordId(String);

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RecordId(s.to_string()))
    }
}

impl Deref for RecordId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(fr: String) -> Self {
        RecordId(fr)
    }
}

impl From<RecordId> for String {
    fn from(fr: RecordId) -> Self {
        fr.0
    }
}

impl RecordId {
    #[inline]
    pub fn new() -> RecordId {
        RecordId(rusty_ulid::generate_ulid_string())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

/// Principal that owns stored records. Every store call takes one explicitly.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        OwnerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(fr: &str) -> Self {
        OwnerId(fr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_are_unique() {
        let a = RecordId::new();
        let b = RecordId::new();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }

    #[test]
    fn test_owner_id_serializes_transparently() {
        let owner = OwnerId::new("user-1");
        assert_eq!(serde_json::to_string(&owner).unwrap(), "\"user-1\"");
    }
}
