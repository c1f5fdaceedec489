//! Error types and result types for document store operations.
//!
//! Every fallible operation in this crate returns [`DocumentStoreResult<T>`].
//! Errors are grouped by cause: malformed queries and updates, type mismatches
//! while applying updates, key conflicts, storage backend failures and missing
//! entities.

use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Boxed error used to carry the underlying cause of a backend failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Represents all possible errors that can occur when interacting with a document store.
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    /// A malformed query or update expression, or an unknown operator.
    #[error("Query error: {0}")]
    Query(String),
    /// An update operator was applied to an incompatible existing value,
    /// e.g. `$inc` on a string field.
    #[error("Type error: {0}")]
    Type(String),
    /// A document with the given id already exists.
    /// The first argument is the document id, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DuplicateKey(String, String),
    /// A write would produce two documents with the same key in a unique index.
    #[error("Unique constraint violated on index {index} for key {key}")]
    UniqueConstraint {
        /// Name of the violated index.
        index: String,
        /// Rendered key tuple that collided.
        key: String,
    },
    /// The storage backend failed to load or save a snapshot.
    #[error("Adapter error: {message}")]
    Adapter {
        /// What the store was doing when the backend failed.
        message: String,
        /// The backend's own error, if it provided one.
        #[source]
        source: Option<BoxError>,
    },
    /// A referenced id, index, subscription or collection does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The document has an invalid structure (not an object, non-string id).
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// The index definition is invalid or clashes with an existing one.
    #[error("Invalid index: {0}")]
    InvalidIndex(String),
    /// Serialization/deserialization error when converting documents.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Compressing or decompressing a stored document failed.
    #[error("Compression error: {0}")]
    Compression(String),
    /// A plugin hook failed.
    #[error("Plugin {plugin} failed: {message}")]
    Plugin {
        /// Name of the failing plugin.
        plugin: String,
        /// Failure description.
        message: String,
    },
}

impl DocumentStoreError {
    /// Wraps a backend failure together with its cause.
    pub fn adapter(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        DocumentStoreError::Adapter {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Builds a plugin failure.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        DocumentStoreError::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// A specialized `Result` type for document store operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DocumentStoreError {
    fn from(err: std::io::Error) -> Self {
        DocumentStoreError::Compression(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_adapter_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = DocumentStoreError::adapter("save failed", io);

        assert_eq!(err.to_string(), "Adapter error: save failed");
        assert_eq!(err.source().map(|s| s.to_string()), Some("disk full".to_string()));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err: DocumentStoreError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();

        assert!(matches!(err, DocumentStoreError::Serialization(_)));
    }
}
