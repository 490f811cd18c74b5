//! Strongly-typed identifiers for requestor entities
//!
//! Marketplace ids are assigned by the daemon and are opaque strings. Run ids
//! are generated locally and are UUID-based.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a daemon-side resource (demand, proposal, agreement, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier of a run (one logical execution of a work source)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse either a bare UUID or a `run:`-prefixed one.
    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        let raw = value.strip_prefix("run:").unwrap_or(value);
        Uuid::parse_str(raw).map(Self)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run:{}", self.0)
    }
}

/// Identifier of a unit of work pulled from a task source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_roundtrip_through_display() {
        let id = RunId::generate();
        let parsed = RunId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let bare = RunId::parse(&id.as_uuid().to_string()).unwrap();
        assert_eq!(id, bare);
    }

    #[test]
    fn test_run_id_rejects_garbage() {
        assert!(RunId::parse("run:not-a-uuid").is_err());
    }

    #[test]
    fn test_resource_id_is_opaque() {
        let id = ResourceId::new("R-0001");
        assert_eq!(id.to_string(), "R-0001");
        assert_eq!(id.as_str(), "R-0001");
        assert_ne!(ResourceId::generate(), ResourceId::generate());
    }
}
