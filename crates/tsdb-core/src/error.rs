use thiserror::Error;

use crate::schema::FieldType;

#[derive(Debug, Error)]
pub enum TsdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("primary key not found: {0}")]
    NotFound(String),
    #[error("duplicate primary key: {0}")]
    DuplicateKey(String),
    #[error("series length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("type error on field '{field}': expected {expected}, got {found}")]
    Type {
        field: String,
        expected: FieldType,
        found: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("no index entry for value {value} and key '{pk}'")]
    IndexEntryMissing { value: String, pk: String },
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TsdbError>;
