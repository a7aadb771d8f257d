use thiserror::Error;

use crate::layout::Version;

/// Error types for schema operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema {id:#010x} is not registered")]
    UnknownSchema { id: u32 },

    #[error("schema {id:#010x} v{version} conflicts with a registered field table: {reason}")]
    DuplicateSchema {
        id: u32,
        version: Version,
        reason: String,
    },

    #[error("payload does not match schema {id:#010x}: {reason}")]
    SchemaMismatch { id: u32, reason: String },

    #[error("schema {id:#010x}: payload version {payload} is incompatible ({reason})")]
    VersionIncompatible {
        id: u32,
        payload: Version,
        reason: String,
    },

    #[error("invalid field table: {0}")]
    InvalidLayout(String),
}

impl SchemaError {
    pub(crate) fn mismatch(id: u32, reason: impl Into<String>) -> Self {
        SchemaError::SchemaMismatch {
            id,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, SchemaError>;
