//! Network operations and batch results.
//!
//! An operation is the unit submitted to the network collaborator: a patch
//! or a fetch, tagged with its resource name and operation key under `_m`.
//! The server answers with one batch item per submitted operation.

use crate::entity::{META_KEY, OP_KEY, QUERY_KEY, RESOURCE_KEY};
use crate::error::{ProtocolError, ProtocolResult};
use crate::patch::Patch;
use serde_json::{Map, Value};

/// The operation key used for patch submissions.
pub const PATCH_OP: &str = "patch";
/// The default operation key for fetches.
pub const FETCH_OP: &str = "fetch";

/// What an operation asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Apply a patch.
    Patch,
    /// Run a named fetch (the key selects a registered server-side query).
    Fetch(String),
}

impl OperationKind {
    /// The `_op` wire key.
    pub fn key(&self) -> &str {
        match self {
            OperationKind::Patch => PATCH_OP,
            OperationKind::Fetch(key) => key,
        }
    }
}

/// A single network operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Resource the operation targets.
    pub resource: String,
    /// Patch or fetch.
    pub kind: OperationKind,
    /// Patch payload, for patch operations.
    pub patch: Option<Patch>,
    /// Query parameters, for fetch operations.
    pub query: Option<Map<String, Value>>,
}

impl Operation {
    /// Wraps a patch as an outbound operation.
    pub fn patch(patch: Patch) -> Self {
        Self {
            resource: patch.resource.clone(),
            kind: OperationKind::Patch,
            patch: Some(patch),
            query: None,
        }
    }

    /// Builds a fetch operation with a named operation key and query.
    pub fn fetch(
        resource: impl Into<String>,
        key: impl Into<String>,
        query: Map<String, Value>,
    ) -> Self {
        Self {
            resource: resource.into(),
            kind: OperationKind::Fetch(key.into()),
            patch: None,
            query: Some(query),
        }
    }

    /// Encodes the wire shape: the patch payload (or an identity-less stub
    /// for fetches) with `_m:{_r,_op[,_query]}`.
    pub fn to_wire(&self) -> Value {
        let mut map = match &self.patch {
            Some(patch) => match patch.to_wire() {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };

        let meta = map
            .entry(META_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert(RESOURCE_KEY.to_string(), Value::from(self.resource.clone()));
            meta.insert(OP_KEY.to_string(), Value::from(self.kind.key()));
            if let Some(query) = &self.query {
                meta.insert(QUERY_KEY.to_string(), Value::Object(query.clone()));
            }
        }
        Value::Object(map)
    }

    /// Decodes an operation from its wire shape. An absent `_op` key means
    /// a patch (the shape servers answer with).
    pub fn from_wire(value: Value) -> ProtocolResult<Self> {
        let meta = value
            .get(META_KEY)
            .and_then(Value::as_object)
            .ok_or_else(|| ProtocolError::MalformedPatch("operation without metadata".into()))?;
        let resource = meta
            .get(RESOURCE_KEY)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingGuid)?
            .to_string();
        let op_key = meta
            .get(OP_KEY)
            .and_then(Value::as_str)
            .unwrap_or(PATCH_OP)
            .to_string();
        let query = meta
            .get(QUERY_KEY)
            .and_then(Value::as_object)
            .cloned();

        if op_key == PATCH_OP {
            Ok(Self {
                resource,
                kind: OperationKind::Patch,
                patch: Some(Patch::from_wire(value)?),
                query,
            })
        } else {
            Ok(Self {
                resource,
                kind: OperationKind::Fetch(op_key),
                patch: None,
                query,
            })
        }
    }
}

/// Wire key marking a per-item batch failure.
pub const ERROR_KEY: &str = "_err";

/// The server's answer to one submitted operation: a single resulting
/// operation, a cascade of operations (the primary result plus related
/// entity updates), or a per-item failure.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    /// One resulting operation (wire form).
    One(Value),
    /// A cascade of resulting operations; the first is the primary result.
    Many(Vec<Value>),
    /// The operation failed on the server.
    Failed(String),
}

impl BatchItem {
    /// Decodes a response item: arrays are cascades, objects with `_err`
    /// are failures, anything else is a single result.
    pub fn from_wire(value: Value) -> Self {
        if let Some(message) = value.get(ERROR_KEY).and_then(Value::as_str) {
            return BatchItem::Failed(message.to_string());
        }
        match value {
            Value::Array(items) => BatchItem::Many(items),
            other => BatchItem::One(other),
        }
    }

    /// Encodes the response item.
    pub fn to_wire(&self) -> Value {
        match self {
            BatchItem::One(value) => value.clone(),
            BatchItem::Many(items) => Value::Array(items.clone()),
            BatchItem::Failed(message) => {
                let mut map = Map::new();
                map.insert(ERROR_KEY.to_string(), Value::from(message.clone()));
                Value::Object(map)
            }
        }
    }

    /// The resulting operations, in order. Empty for failures.
    pub fn operations(&self) -> Vec<&Value> {
        match self {
            BatchItem::One(value) => vec![value],
            BatchItem::Many(items) => items.iter().collect(),
            BatchItem::Failed(_) => Vec::new(),
        }
    }
}
