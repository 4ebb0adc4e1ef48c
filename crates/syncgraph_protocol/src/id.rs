//! Entity identifiers and GUIDs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Scalar identifier of an entity.
///
/// Servers may hand out either numeric or text identifiers; both forms
/// address the same entity as long as their rendered form matches.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Numeric identifier.
    Integer(i64),
    /// Text identifier.
    Text(String),
}

impl EntityId {
    /// Extracts an identifier from a JSON value.
    ///
    /// Returns `None` for anything other than an integer or a string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityId::Integer),
            Value::String(s) => Some(EntityId::Text(s.clone())),
            _ => None,
        }
    }

    /// Converts back to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Integer(n) => Value::from(*n),
            EntityId::Text(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({self})")
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Integer(n) => write!(f, "{n}"),
            EntityId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        EntityId::Integer(n)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Text(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId::Text(s)
    }
}

/// Composite key uniquely identifying a tracked entity: resource name plus
/// identifier, rendered as `resource/id`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid {
    /// Resource name.
    pub resource: String,
    /// Entity identifier.
    pub id: EntityId,
}

impl Guid {
    /// Creates a GUID from a resource name and identifier.
    pub fn new(resource: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            resource: resource.into(),
            id: id.into(),
        }
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.id)
    }
}
