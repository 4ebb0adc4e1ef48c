//! Versioned, path-keyed entity patches.
//!
//! A patch describes field-level changes to exactly one entity. It is
//! created by the store's change observation (or received from the
//! network), consumed exactly once by patch application, then discarded.

use crate::entity::{self, EntityRef, ID_KEY, META_KEY, RESOURCE_KEY, VERSION_KEY};
use crate::error::{ProtocolError, ProtocolResult};
use crate::id::{EntityId, Guid};
use crate::path::FieldPath;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// An in-place array mutation: remove `removed` elements at `index`, then
/// insert `inserted` there. Wire form: `[index, removed, [inserted...]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Splice {
    /// Start index of the mutation.
    pub index: usize,
    /// Number of removed elements.
    pub removed: usize,
    /// Values inserted at `index`.
    pub inserted: Vec<Value>,
}

impl Splice {
    /// Creates a splice descriptor.
    pub fn new(index: usize, removed: usize, inserted: Vec<Value>) -> Self {
        Self {
            index,
            removed,
            inserted,
        }
    }

    /// Encodes the wire triple.
    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            Value::from(self.index),
            Value::from(self.removed),
            Value::Array(self.inserted.clone()),
        ])
    }

    /// Decodes a wire triple, if the value has the right shape.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let triple = value.as_array()?;
        if triple.len() != 3 {
            return None;
        }
        Some(Self {
            index: triple[0].as_u64()? as usize,
            removed: triple[1].as_u64()? as usize,
            inserted: triple[2].as_array()?.clone(),
        })
    }
}

/// The value side of one patch field.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    /// Overwrite the field with a value.
    Set(Value),
    /// Remove the field. Serializes as `null` on the wire; `null` is
    /// therefore not a legal domain value.
    Delete,
    /// An entity-valued field, carried as an identity proxy.
    Ref(EntityRef),
    /// An array field, carried as one or more splice descriptors.
    Splices(Vec<Splice>),
}

impl PatchValue {
    fn to_wire(&self) -> Value {
        match self {
            PatchValue::Set(value) => value.clone(),
            PatchValue::Delete => Value::Null,
            PatchValue::Ref(proxy) => proxy.to_value(),
            PatchValue::Splices(splices) => {
                Value::Array(splices.iter().map(Splice::to_wire).collect())
            }
        }
    }

    fn from_wire(value: Value) -> Self {
        if value.is_null() {
            return PatchValue::Delete;
        }
        if let Some(proxy) = EntityRef::of(&value) {
            return PatchValue::Ref(proxy);
        }
        if let Value::Array(items) = &value {
            if !items.is_empty() {
                let splices: Option<Vec<Splice>> = items.iter().map(Splice::from_wire).collect();
                if let Some(splices) = splices {
                    return PatchValue::Splices(splices);
                }
            }
        }
        PatchValue::Set(value)
    }
}

/// A path-keyed diff targeting one entity, tagged with the entity's
/// identifier, resource name, and (optionally) version.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Identifier of the target entity.
    pub id: EntityId,
    /// Resource name of the target entity.
    pub resource: String,
    /// Version of the entity the patch was produced against. Absent for
    /// plain merges with no version check.
    pub version: Option<u64>,
    fields: BTreeMap<String, PatchValue>,
}

impl Patch {
    /// Creates an empty patch for the given target.
    pub fn new(resource: impl Into<String>, id: impl Into<EntityId>, version: Option<u64>) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    /// Creates an empty patch targeting an existing entity document,
    /// carrying its current identity and version.
    pub fn for_entity(entity: &Value) -> ProtocolResult<Self> {
        let guid = entity::guid_of(entity).ok_or(ProtocolError::MissingGuid)?;
        Ok(Self::new(guid.resource, guid.id, entity::version_of(entity)))
    }

    /// The GUID of the target entity.
    pub fn guid(&self) -> Guid {
        Guid {
            resource: self.resource.clone(),
            id: self.id.clone(),
        }
    }

    /// Records a value overwrite. Entity values are reduced to identity
    /// proxies; `null` is rejected as a domain value.
    pub fn set(&mut self, path: &FieldPath, value: Value) -> ProtocolResult<()> {
        if value.is_null() {
            return Err(ProtocolError::NullDomainValue {
                path: path.to_string(),
            });
        }
        let patch_value = match EntityRef::of(&value) {
            Some(proxy) => PatchValue::Ref(proxy),
            None => PatchValue::Set(value),
        };
        self.fields.insert(path.to_string(), patch_value);
        Ok(())
    }

    /// Records a field deletion.
    pub fn delete(&mut self, path: &FieldPath) {
        self.fields.insert(path.to_string(), PatchValue::Delete);
    }

    /// Records an entity reference.
    pub fn reference(&mut self, path: &FieldPath, proxy: EntityRef) {
        self.fields.insert(path.to_string(), PatchValue::Ref(proxy));
    }

    /// Appends a splice to an array field. Repeated splices on the same
    /// path within one patch accumulate in order.
    pub fn splice(&mut self, path: &FieldPath, splice: Splice) {
        match self
            .fields
            .entry(path.to_string())
            .or_insert_with(|| PatchValue::Splices(Vec::new()))
        {
            PatchValue::Splices(splices) => splices.push(splice),
            other => *other = PatchValue::Splices(vec![splice]),
        }
    }

    /// Returns true if the patch carries no field changes.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of field changes.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Iterates field changes in path order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &PatchValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A metadata-only version bump: carries a version and no fields.
    /// Applied by updating the target's version in place.
    pub fn is_version_bump(&self) -> bool {
        self.version.is_some() && self.fields.is_empty()
    }

    /// Encodes the wire shape `{id, _m:{_r[,_v]}, "<path>": <value>, ...}`.
    pub fn to_wire(&self) -> Value {
        let mut meta = Map::new();
        meta.insert(RESOURCE_KEY.to_string(), Value::from(self.resource.clone()));
        if let Some(version) = self.version {
            meta.insert(VERSION_KEY.to_string(), Value::from(version));
        }

        let mut map = Map::new();
        map.insert(ID_KEY.to_string(), self.id.to_value());
        map.insert(META_KEY.to_string(), Value::Object(meta));
        for (path, value) in &self.fields {
            map.insert(path.clone(), value.to_wire());
        }
        Value::Object(map)
    }

    /// Decodes a patch from its wire shape, validating structure.
    pub fn from_wire(value: Value) -> ProtocolResult<Self> {
        let Value::Object(map) = value else {
            return Err(ProtocolError::MalformedPatch("expected an object".into()));
        };

        let id = map
            .get(ID_KEY)
            .and_then(EntityId::from_value)
            .ok_or(ProtocolError::MissingGuid)?;
        let meta = map
            .get(META_KEY)
            .and_then(Value::as_object)
            .ok_or(ProtocolError::MissingGuid)?;
        let resource = meta
            .get(RESOURCE_KEY)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingGuid)?
            .to_string();
        let version = match meta.get(VERSION_KEY) {
            None => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                ProtocolError::MalformedPatch(format!("non-integer version: {v}"))
            })?),
        };

        let mut patch = Patch::new(resource, id, version);
        for (key, value) in map {
            if key == ID_KEY || key == META_KEY {
                continue;
            }
            // Normalizes the path once at the wire boundary.
            let path = FieldPath::parse(&key)?;
            patch
                .fields
                .insert(path.to_string(), PatchValue::from_wire(value));
        }
        Ok(patch)
    }
}
