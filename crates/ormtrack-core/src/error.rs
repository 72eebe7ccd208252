//! Error types for ormtrack.
//!
//! Every condition is reported synchronously to the direct caller of the
//! operation that raised it. Nothing in the tracking layer retries.

use std::error::Error as StdError;
use std::fmt;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the change tracker, the save pipeline and model building.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Two distinct entity instances resolve to the same identity.
    DuplicateKey {
        /// Entity type name.
        entity_type: String,
        /// Rendered key values.
        key: String,
    },
    /// DetectChanges was invoked while a detection pass was already running.
    RecursiveDetection,
    /// The write batch could not be ordered because of a dependency cycle.
    CyclicDependency {
        /// Entity types taking part in the cycle.
        entity_types: Vec<String>,
    },
    /// The gateway found no row with the expected key/concurrency token.
    ConcurrencyConflict {
        /// Entity type name.
        entity_type: String,
        /// Rendered key values.
        key: String,
    },
    /// Any other write failure reported by the gateway.
    Storage(StorageError),
    /// Overlapping use of one session was detected.
    ConcurrentAccess {
        /// The operation that found the session busy.
        operation: &'static str,
    },
    /// The entity type is not part of the model.
    UnknownEntityType(String),
    /// The property or navigation is not declared on the entity type.
    UnknownProperty {
        /// Entity type name.
        entity_type: String,
        /// Property name.
        property: String,
    },
    /// A key property of an entity that exists in the database was changed.
    KeyModified {
        /// Entity type name.
        entity_type: String,
        /// Key property name.
        property: String,
    },
    /// The model metadata is inconsistent.
    InvalidModel(String),
    /// The requested operation is not valid for the entry's current state.
    InvalidOperation(String),
}

/// Detail of a storage-level write failure.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageError {
    /// Entity type of the failing command, when known.
    pub entity_type: Option<String>,
    /// Failure description from the gateway.
    pub message: String,
}

impl StorageError {
    /// Create a storage error without entity context.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            entity_type: None,
            message: message.into(),
        }
    }

    /// Attach the entity type of the failing command.
    #[must_use]
    pub fn for_entity(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

impl Error {
    /// Whether the caller should reload and retry.
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_type {
            Some(ty) => write!(f, "{} (entity type {})", self.message, ty),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateKey { entity_type, key } => write!(
                f,
                "another instance of '{}' with key {} is already being tracked",
                entity_type, key
            ),
            Error::RecursiveDetection => {
                write!(f, "change detection was invoked while already running")
            }
            Error::CyclicDependency { entity_types } => write!(
                f,
                "unable to order writes: circular dependency between {}",
                entity_types.join(" -> ")
            ),
            Error::ConcurrencyConflict { entity_type, key } => write!(
                f,
                "concurrency conflict on '{}' with key {}: the row was changed or removed",
                entity_type, key
            ),
            Error::Storage(err) => write!(f, "storage error: {}", err),
            Error::ConcurrentAccess { operation } => write!(
                f,
                "'{}' started while another operation on this session was still running",
                operation
            ),
            Error::UnknownEntityType(name) => write!(f, "unknown entity type '{}'", name),
            Error::UnknownProperty {
                entity_type,
                property,
            } => write!(f, "'{}' has no property '{}'", entity_type, property),
            Error::KeyModified {
                entity_type,
                property,
            } => write!(
                f,
                "key property '{}.{}' cannot be modified once the entity exists",
                entity_type, property
            ),
            Error::InvalidModel(msg) => write!(f, "invalid model: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
        }
    }
}

impl StdError for Error {}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_duplicate_key() {
        let err = Error::DuplicateKey {
            entity_type: "Blog".into(),
            key: "(1)".into(),
        };
        assert_eq!(
            err.to_string(),
            "another instance of 'Blog' with key (1) is already being tracked"
        );
    }

    #[test]
    fn test_storage_error_context() {
        let err: Error = StorageError::new("unique violation").for_entity("Post").into();
        assert_eq!(
            err.to_string(),
            "storage error: unique violation (entity type Post)"
        );
    }

    #[test]
    fn test_classification() {
        assert!(
            Error::ConcurrencyConflict {
                entity_type: "Blog".into(),
                key: "(1)".into()
            }
            .is_concurrency_conflict()
        );
        assert!(!Error::RecursiveDetection.is_concurrency_conflict());
    }
}
