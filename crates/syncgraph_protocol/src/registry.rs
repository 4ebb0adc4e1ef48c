//! Per-resource registry: templates, validators, and operation specs.

use crate::entity::{ID_KEY, META_KEY, RESOURCE_KEY, VERSION_KEY};
use crate::error::{ProtocolError, ProtocolResult};
use crate::path::FieldPath;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata key under which a field's validation record is stored
/// (`parent._m.<field>.valid`).
pub const VALIDATION_KEY: &str = "valid";

/// Outcome of validating one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    /// The value is acceptable.
    Valid,
    /// The value was rejected; the field is excluded from the patch.
    Invalid,
}

/// A validation result, recorded at the field's metadata path.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Valid or invalid.
    pub state: ValidationState,
    /// Optional human-readable rejection reason.
    pub message: Option<String>,
}

impl Validation {
    /// A passing validation.
    pub fn valid() -> Self {
        Self {
            state: ValidationState::Valid,
            message: None,
        }
    }

    /// A failing validation with a reason.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            state: ValidationState::Invalid,
            message: Some(message.into()),
        }
    }

    /// Returns true if the state is valid.
    pub fn is_valid(&self) -> bool {
        self.state == ValidationState::Valid
    }

    /// Renders the record stored in entity metadata.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        let state = match self.state {
            ValidationState::Valid => "valid",
            ValidationState::Invalid => "invalid",
        };
        map.insert("state".to_string(), Value::from(state));
        if let Some(message) = &self.message {
            map.insert("message".to_string(), Value::from(message.clone()));
        }
        Value::Object(map)
    }
}

/// A pure per-path validator. `None` means the field is being removed.
pub type Validator = Arc<dyn Fn(Option<&Value>) -> Validation + Send + Sync>;

/// Signature of a named server-side operation, used to generate fetchers
/// on the client facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    /// Positional argument names, mapped into the query in order.
    pub args: Vec<String>,
    /// Whether the operation yields at most one primary entity.
    pub unique: bool,
}

impl OperationSpec {
    /// A multi-result operation with the given argument names.
    pub fn many(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            unique: false,
        }
    }

    /// A unique-result operation with the given argument names.
    pub fn one(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            unique: true,
        }
    }
}

/// A registered entity kind: its default shape, per-path validators, and
/// named operations.
pub struct Resource {
    /// Resource name, unique within a registry.
    pub name: String,
    /// Name of the resource this one specializes, if any.
    pub parent: Option<String>,
    template: Map<String, Value>,
    validators: HashMap<String, Validator>,
    operations: HashMap<String, OperationSpec>,
}

impl Resource {
    /// Creates a resource with an empty template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            template: Map::new(),
            validators: HashMap::new(),
            operations: HashMap::new(),
        }
    }

    /// Declares the resource this one specializes.
    pub fn specializes(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Sets the default entity shape. Any `_m` keys inside the supplied
    /// template are scrubbed; the template's metadata is seeded with this
    /// resource's name.
    pub fn with_template(mut self, template: Value) -> Self {
        let mut template = match template {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        scrub_meta(&mut template);
        let Value::Object(mut map) = template else {
            unreachable!()
        };
        map.insert(
            META_KEY.to_string(),
            json!({ RESOURCE_KEY: self.name.clone() }),
        );
        self.template = map;
        self
    }

    /// Registers a validator for one field path.
    pub fn with_validator<F>(mut self, path: &str, validator: F) -> ProtocolResult<Self>
    where
        F: Fn(Option<&Value>) -> Validation + Send + Sync + 'static,
    {
        let path = FieldPath::parse(path)?;
        self.validators.insert(path.to_string(), Arc::new(validator));
        Ok(self)
    }

    /// Declares a named operation.
    pub fn with_operation(mut self, key: impl Into<String>, spec: OperationSpec) -> Self {
        self.operations.insert(key.into(), spec);
        self
    }

    /// The default entity shape (metadata seeded with this resource).
    pub fn template(&self) -> &Map<String, Value> {
        &self.template
    }

    /// Looks up a named operation.
    pub fn operation(&self, key: &str) -> Option<&OperationSpec> {
        self.operations.get(key)
    }

    /// Iterates declared operations.
    pub fn operations(&self) -> impl Iterator<Item = (&str, &OperationSpec)> {
        self.operations.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Validates a field value (`None` = removal) against the validator
    /// registered for its path; unvalidated paths are valid.
    pub fn validate(&self, path: &FieldPath, value: Option<&Value>) -> Validation {
        match self.validators.get(&path.to_string()) {
            Some(validator) => validator(value),
            None => Validation::valid(),
        }
    }

    /// Materializes a new entity: template plus seed fields (the seed's
    /// metadata is ignored), stamped with creation/modification times and
    /// version 1.
    pub fn new_entity(&self, seed: &Map<String, Value>) -> Value {
        let mut map = self.template.clone();
        for (key, value) in seed {
            if key == META_KEY {
                continue;
            }
            map.insert(key.clone(), value.clone());
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        map.insert("created".to_string(), Value::from(now));
        map.insert("modified".to_string(), Value::from(now));
        map.insert(
            META_KEY.to_string(),
            json!({ RESOURCE_KEY: self.name.clone(), VERSION_KEY: 1 }),
        );
        Value::Object(map)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("validators", &self.validators.len())
            .field("operations", &self.operations.keys())
            .finish()
    }
}

fn scrub_meta(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(META_KEY);
            for (_, nested) in map.iter_mut() {
                scrub_meta(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                scrub_meta(item);
            }
        }
        _ => {}
    }
}

/// The resource registry: resource name to [`Resource`].
#[derive(Debug, Default)]
pub struct Registry {
    resources: RwLock<HashMap<String, Arc<Resource>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource. Fails with [`ProtocolError::DuplicateResource`]
    /// if the name is taken and the new resource does not specialize the
    /// existing entry (via its parent chain).
    pub fn register(&self, resource: Resource) -> ProtocolResult<()> {
        let mut resources = self.resources.write();
        if resources.contains_key(&resource.name)
            && !chain_reaches(&resources, &resource, &resource.name)
        {
            return Err(ProtocolError::DuplicateResource {
                name: resource.name.clone(),
            });
        }
        resources.insert(resource.name.clone(), Arc::new(resource));
        Ok(())
    }

    /// Registers several resources, stopping at the first failure.
    pub fn register_all(&self, resources: Vec<Resource>) -> ProtocolResult<()> {
        for resource in resources {
            self.register(resource)?;
        }
        Ok(())
    }

    /// Looks up a resource by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.read().get(name).cloned()
    }

    /// Resolves the resource of an entity document via its metadata.
    pub fn for_entity(&self, entity: &Value) -> Option<Arc<Resource>> {
        self.lookup(crate::entity::resource_of(entity)?)
    }

    /// Materializes a new entity of the named kind; `None` if the resource
    /// is unknown. The seed should carry the entity's `id`.
    pub fn new_entity(&self, name: &str, seed: &Map<String, Value>) -> Option<Value> {
        Some(self.lookup(name)?.new_entity(seed))
    }
}

// Walks the parent chain of `resource` (through already-registered
// parents) looking for `target`.
fn chain_reaches(
    resources: &HashMap<String, Arc<Resource>>,
    resource: &Resource,
    target: &str,
) -> bool {
    let mut next = resource.parent.clone();
    while let Some(name) = next {
        if name == target {
            return true;
        }
        next = resources.get(&name).and_then(|r| r.parent.clone());
    }
    false
}
