//! # Syncgraph Protocol
//!
//! Entity model, field paths, and patch wire types for syncgraph.
//!
//! This crate provides:
//! - The entity document model (`id` + `_m` metadata over JSON values)
//! - `EntityRef` identity proxies and GUID addressing
//! - Typed field paths with a single normalization boundary
//! - `Patch` / `Operation` wire types and their JSON codecs
//! - The resource registry (templates, validators, operation specs)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod id;
mod operation;
mod patch;
mod path;
mod registry;

pub use entity::{
    guid_of, id_of, is_entity, meta_of, resource_of, set_version, strip, version_of, EntityRef,
    ID_KEY, META_KEY, OP_KEY, QUERY_KEY, RESOURCE_KEY, VERSION_KEY,
};
pub use error::{ProtocolError, ProtocolResult};
pub use id::{EntityId, Guid};
pub use operation::{BatchItem, Operation, OperationKind, ERROR_KEY, FETCH_OP, PATCH_OP};
pub use patch::{Patch, PatchValue, Splice};
pub use path::{FieldPath, Segment};
pub use registry::{
    OperationSpec, Registry, Resource, Validation, ValidationState, Validator, VALIDATION_KEY,
};
