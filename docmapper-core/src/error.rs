//! Error types and result types for mapping and document store operations.
//!
//! Every fallible operation in the crate returns [`MapperResult<T>`]. The
//! variants follow the failure classes of the mapping layer: structural adapter
//! failures, value mapping failures, configuration and state violations, and
//! errors reported by the underlying document store, which are passed through
//! as-is.

use std::fmt::Display;

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors raised while mapping values or talking to a store.
#[derive(Error, Debug)]
pub enum MapperError {
    /// Generic serde failure raised by a `Serialize` or `Deserialize` implementation.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A sink or source was driven with unbalanced or out-of-order calls.
    ///
    /// This always points at a bug in a codec or serializer, never at bad data.
    #[error("Invalid document structure: {0}")]
    Structure(String),
    /// A codec received a runtime value it cannot convert.
    #[error("Cannot map value of type {type_name}: {message}")]
    Mapping {
        /// The runtime type of the offending value.
        type_name: String,
        /// What the codec expected.
        message: String,
    },
    /// A mapping error raised while serializing the value of a specific field path.
    #[error("Field '{path}': {source}")]
    Field {
        /// The dotted field path being serialized.
        path: String,
        /// The underlying error.
        #[source]
        source: Box<MapperError>,
    },
    /// The mapper, a schema or a builder is configured inconsistently.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A codec was asked to write to a serializer that cannot carry native values.
    #[error("Unsupported sink {0}: codec values can only be written through the document mapper")]
    UnsupportedSink(String),
    /// An operation was attempted in a state that does not allow it.
    #[error("Illegal state: {0}")]
    IllegalState(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A document with the given id already exists in the collection.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// The requested document was not found in the collection.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// An error reported by the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A specialized `Result` type for mapper operations.
pub type MapperResult<T> = Result<T, MapperError>;

impl MapperError {
    /// Creates a [`MapperError::Mapping`] for a BSON value the caller could not convert.
    pub fn mapping(value: &bson::Bson, message: impl Into<String>) -> Self {
        MapperError::Mapping {
            type_name: format!("{:?}", value.element_type()),
            message: message.into(),
        }
    }

    /// Attaches a field path to this error.
    ///
    /// Errors that already carry a path are returned unchanged so the innermost
    /// path wins.
    pub fn at_path(self, path: impl Into<String>) -> Self {
        match self {
            MapperError::Field { .. } => self,
            other => MapperError::Field {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }
}

impl serde::ser::Error for MapperError {
    fn custom<T: Display>(msg: T) -> Self {
        MapperError::Serialization(msg.to_string())
    }
}

impl serde::de::Error for MapperError {
    fn custom<T: Display>(msg: T) -> Self {
        MapperError::Serialization(msg.to_string())
    }
}

impl From<BsonError> for MapperError {
    fn from(err: BsonError) -> Self {
        MapperError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for MapperError {
    fn from(err: SerdeJsonError) -> Self {
        MapperError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;

    #[test]
    fn test_mapping_error_names_runtime_type() {
        let err = MapperError::mapping(&Bson::Boolean(true), "expected an object id");

        assert_eq!(
            err.to_string(),
            "Cannot map value of type Boolean: expected an object id"
        );
    }

    #[test]
    fn test_innermost_path_is_kept() {
        let err = MapperError::Configuration("boom".into())
            .at_path("child.simple")
            .at_path("child");

        assert!(err.to_string().starts_with("Field 'child.simple'"));
    }
}
