//! The entity document model.
//!
//! Entities are JSON objects with a reserved identifier field (`id`) and a
//! metadata field (`_m`) carrying the resource name (`_r`) and version
//! (`_v`). All other fields are domain data: scalars, nested objects,
//! arrays, or identity proxies referencing other entities.

use crate::id::{EntityId, Guid};
use serde_json::{json, Map, Value};

/// Reserved identifier field on every entity document.
pub const ID_KEY: &str = "id";
/// Reserved metadata field on every entity document.
pub const META_KEY: &str = "_m";
/// Metadata key carrying the resource name.
pub const RESOURCE_KEY: &str = "_r";
/// Metadata key carrying the entity version.
pub const VERSION_KEY: &str = "_v";
/// Metadata key tagging a network operation with its operation key.
pub const OP_KEY: &str = "_op";
/// Metadata key carrying a fetch query.
pub const QUERY_KEY: &str = "_query";

/// Returns true if the value satisfies the entity predicate: an object
/// carrying an `id` and a `_m._r` resource name.
pub fn is_entity(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    map.contains_key(ID_KEY)
        && map
            .get(META_KEY)
            .and_then(|m| m.get(RESOURCE_KEY))
            .and_then(Value::as_str)
            .is_some()
}

/// The metadata map of an entity, if present.
pub fn meta_of(value: &Value) -> Option<&Map<String, Value>> {
    value.get(META_KEY)?.as_object()
}

/// The identifier of an entity document.
pub fn id_of(value: &Value) -> Option<EntityId> {
    EntityId::from_value(value.get(ID_KEY)?)
}

/// The resource name of an entity document.
pub fn resource_of(value: &Value) -> Option<&str> {
    meta_of(value)?.get(RESOURCE_KEY)?.as_str()
}

/// The GUID of an entity document, if it has both an id and a resource.
pub fn guid_of(value: &Value) -> Option<Guid> {
    Some(Guid {
        resource: resource_of(value)?.to_string(),
        id: id_of(value)?,
    })
}

/// The version of an entity document. Hydrated entities always carry one;
/// identity proxies may not.
pub fn version_of(value: &Value) -> Option<u64> {
    meta_of(value)?.get(VERSION_KEY)?.as_u64()
}

/// Sets the version of an entity document, creating the metadata map if
/// missing.
pub fn set_version(value: &mut Value, version: u64) {
    if let Value::Object(map) = value {
        let meta = map
            .entry(META_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert(VERSION_KEY.to_string(), Value::from(version));
        }
    }
}

/// Strips an entity down to its identity fields (`id` and `_m._r`),
/// discarding domain data, version, and per-field metadata. Used by the
/// Replace reconciliation mode before re-seeding from the template.
pub fn strip(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    let id = map.get(ID_KEY).cloned();
    let resource = map
        .get(META_KEY)
        .and_then(|m| m.get(RESOURCE_KEY))
        .cloned();
    map.clear();
    if let Some(id) = id {
        map.insert(ID_KEY.to_string(), id);
    }
    if let Some(resource) = resource {
        map.insert(META_KEY.to_string(), json!({ RESOURCE_KEY: resource }));
    }
}

/// A minimal entity stub: identifier, resource name, and optionally the
/// version. This is how entity references are stored at rest inside other
/// entities and inside patches, never as deep copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    /// Resource name of the referenced entity.
    pub resource: String,
    /// Identifier of the referenced entity.
    pub id: EntityId,
    /// Version, when known.
    pub version: Option<u64>,
}

impl EntityRef {
    /// Creates a reference without a version.
    pub fn new(resource: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            resource: resource.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Derives the identity proxy of an entity document.
    pub fn of(value: &Value) -> Option<Self> {
        if !is_entity(value) {
            return None;
        }
        Some(Self {
            resource: resource_of(value)?.to_string(),
            id: id_of(value)?,
            version: version_of(value),
        })
    }

    /// The GUID this reference resolves through.
    pub fn guid(&self) -> Guid {
        Guid {
            resource: self.resource.clone(),
            id: self.id.clone(),
        }
    }

    /// Renders the minimal `{id, _m:{_r[,_v]}}` document stub.
    pub fn to_value(&self) -> Value {
        let mut meta = Map::new();
        meta.insert(RESOURCE_KEY.to_string(), Value::from(self.resource.clone()));
        if let Some(version) = self.version {
            meta.insert(VERSION_KEY.to_string(), Value::from(version));
        }
        let mut map = Map::new();
        map.insert(ID_KEY.to_string(), self.id.to_value());
        map.insert(META_KEY.to_string(), Value::Object(meta));
        Value::Object(map)
    }
}
