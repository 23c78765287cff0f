//! Row error model.

use thiserror::Error;

/// Result type used by row encoding/decoding.
pub type RowResult<T> = Result<T, RowError>;

/// Failure to map between a stored row and its typed representation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RowError {
    /// A row (or serialized entity) was not a JSON object.
    #[error("row is not an object: {0}")]
    NotAnObject(String),

    /// A primary key column was absent from the row.
    #[error("missing primary key column `{0}`")]
    MissingKeyColumn(String),

    /// A primary key column held a value of the wrong kind.
    #[error("invalid value for key column `{column}`: {reason}")]
    InvalidKeyValue { column: String, reason: String },

    /// The primary key has a different arity than the table declares.
    #[error("key arity mismatch: table has {expected} key columns, got {actual}")]
    KeyArity { expected: usize, actual: usize },

    /// Serializing an entity into a row failed.
    #[error("serialization failed: {0}")]
    Serialize(String),

    /// Deserializing a row into an entity failed.
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

impl RowError {
    pub fn invalid_key(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKeyValue {
            column: column.into(),
            reason: reason.into(),
        }
    }
}
