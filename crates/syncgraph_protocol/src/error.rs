//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building or decoding protocol types.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A patch or fetch carried no resolvable entity identity.
    #[error("no guid could be determined (requires both an id and a resource name)")]
    MissingGuid,

    /// A wire value did not have the expected patch structure.
    #[error("malformed patch: {0}")]
    MalformedPatch(String),

    /// A field path string could not be parsed.
    #[error("invalid field path: {0}")]
    InvalidPath(String),

    /// A resource name is already registered and the new resource does
    /// not specialize the existing one.
    #[error("resource {name:?} is already registered and is not specialized by the new resource")]
    DuplicateResource {
        /// The conflicting resource name.
        name: String,
    },

    /// `null` is reserved as the wire deletion marker and cannot be a
    /// domain value.
    #[error("null is not a legal domain value (reserved as the deletion marker) at {path}")]
    NullDomainValue {
        /// Path of the offending field.
        path: String,
    },

    /// JSON (de)serialization error.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::MissingGuid;
        assert!(err.to_string().contains("guid"));

        let err = ProtocolError::DuplicateResource {
            name: "user".into(),
        };
        assert!(err.to_string().contains("user"));

        let err = ProtocolError::NullDomainValue {
            path: "profile.bio".into(),
        };
        assert!(err.to_string().contains("profile.bio"));
    }
}
