//! Engine error taxonomy.

use syncgraph_protocol::{Guid, ProtocolError};

/// Errors surfaced by the store, dispatcher, and client facade.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A value that must be an entity document is not one.
    #[error("value is not an entity (missing id or _m._r)")]
    NotAnEntity,

    /// A second, different instance was tracked under an existing GUID.
    #[error("entity {guid} is already tracked with different contents")]
    DuplicateTracking {
        /// The contested GUID.
        guid: Guid,
    },

    /// The operation targets a GUID with no tracked instance.
    #[error("entity {guid} is not tracked")]
    Untracked {
        /// The missing GUID.
        guid: Guid,
    },

    /// The entity's stored version metadata is malformed, so no
    /// reconciliation mode can be chosen for the patch.
    #[error("incompatible versions for {guid}: entity {entity}, patch {patch}")]
    IncompatibleVersion {
        /// Target of the patch.
        guid: Guid,
        /// Rendered entity-side version metadata.
        entity: String,
        /// Rendered patch-side version.
        patch: String,
    },

    /// The named resource is not registered.
    #[error("resource {name} is not registered")]
    UnknownResource {
        /// The unknown resource name.
        name: String,
    },

    /// The named operation is not declared on the resource.
    #[error("resource {resource} has no operation {key}")]
    UnknownOperation {
        /// The resource queried.
        resource: String,
        /// The unknown operation key.
        key: String,
    },

    /// A fetch was invoked with the wrong number of arguments.
    #[error("operation {key} on {resource} takes {expected} arguments, got {given}")]
    Arity {
        /// The resource queried.
        resource: String,
        /// The operation key.
        key: String,
        /// Arguments the operation declares.
        expected: usize,
        /// Arguments supplied by the caller.
        given: usize,
    },

    /// A protocol-level failure (paths, wire shapes, registration).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport failed to deliver a batch.
    #[error("transport failure: {message}")]
    Transport {
        /// What went wrong.
        message: String,
        /// Whether retrying the same batch may succeed.
        retryable: bool,
    },

    /// The server rejected one operation within a delivered batch.
    #[error("server rejected operation: {0}")]
    Server(String),

    /// The queued operation was rejected before delivery.
    #[error("operation cancelled before delivery")]
    Cancelled,
}

impl SyncError {
    /// Returns true if retrying the failed action may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { retryable: true, .. })
    }
}

/// Convenience alias for engine results.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = SyncError::Untracked {
            guid: Guid::new("user", 1),
        };
        assert_eq!(err.to_string(), "entity user/1 is not tracked");

        let err = SyncError::Server("no such query".into());
        assert!(err.to_string().contains("no such query"));
    }

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Transport {
            message: "timeout".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!SyncError::Transport {
            message: "401".into(),
            retryable: false
        }
        .is_retryable());
        assert!(!SyncError::NotAnEntity.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn protocol_errors_convert() {
        let err: SyncError = ProtocolError::MissingGuid.into();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
