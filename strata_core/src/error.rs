//! Error types for strata_core.

use crate::object::ObjectClass;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using strata_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scanning, archiving, restoring or talking to a store.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// I/O error tied to a specific filesystem path.
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Object file is corrupted or invalid.
    #[error("Corrupted object at {path}: {reason}")]
    CorruptedObject { path: PathBuf, reason: String },

    /// Invalid id format or encoding.
    #[error("Invalid id: {reason}")]
    InvalidId { reason: String },

    /// Object not found in store.
    #[error("{class} not found: {id}")]
    ObjectNotFound { class: ObjectClass, id: String },

    /// Id prefix matches more than one object.
    #[error("Ambiguous {class} id prefix: {prefix}")]
    AmbiguousId { class: ObjectClass, prefix: String },

    /// Subtree was never inserted into the tree map.
    #[error("Tree {id} is not present in the tree map")]
    TreeNotInMap { id: String },

    /// Stored data violates a structural invariant (e.g. a dir without subtree).
    #[error("Structural error: {reason}")]
    Structural { reason: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Invalid object type.
    #[error("Invalid object type: expected {expected}, got {got}")]
    InvalidObjectType { expected: String, got: String },

    /// Invalid node.
    #[error("Invalid node: {reason}")]
    InvalidNode { reason: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },

    /// Tree or snapshot (de)serialization failed.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Content-defined chunking failed.
    #[error("Chunking error: {reason}")]
    Chunking { reason: String },
}

impl Error {
    /// Create an IoAt error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Create a CorruptedObject error.
    pub fn corrupted_object(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidId error.
    pub fn invalid_id(reason: impl Into<String>) -> Self {
        Error::InvalidId {
            reason: reason.into(),
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(class: ObjectClass, id: impl Into<String>) -> Self {
        Error::ObjectNotFound {
            class,
            id: id.into(),
        }
    }

    /// Create an AmbiguousId error.
    pub fn ambiguous_id(class: ObjectClass, prefix: impl Into<String>) -> Self {
        Error::AmbiguousId {
            class,
            prefix: prefix.into(),
        }
    }

    /// Create a TreeNotInMap error.
    pub fn tree_not_in_map(id: impl Into<String>) -> Self {
        Error::TreeNotInMap { id: id.into() }
    }

    /// Create a Structural error.
    pub fn structural(reason: impl Into<String>) -> Self {
        Error::Structural {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidObjectType error.
    pub fn invalid_object_type(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::InvalidObjectType {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an InvalidNode error.
    pub fn invalid_node(reason: impl Into<String>) -> Self {
        Error::InvalidNode {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Create a Chunking error.
    pub fn chunking(reason: impl Into<String>) -> Self {
        Error::Chunking {
            reason: reason.into(),
        }
    }

    /// The underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Error::Io { source } | Error::IoAt { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True for an I/O "not found" error, i.e. a missing path component.
    pub fn is_not_found_io(&self) -> bool {
        self.io_error()
            .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
    }

    /// True if this error reports corrupt snapshot structure.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural { .. })
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
