use serde_json::{json, Value};
use thiserror::Error;
use tsdb_core::TsdbError;

use crate::ops::Status;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Db(#[from] TsdbError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unknown operation: {0}")]
    UnknownOp(String),
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),
    #[error("unknown trigger event: {0}")]
    UnknownEvent(String),
    #[error("procedure failed: {0}")]
    Procedure(String),
    #[error("dispatcher is not running")]
    Unavailable,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Status reported to the client for this failure.
    pub fn status(&self) -> Status {
        match self {
            ServerError::Db(TsdbError::DuplicateKey(_)) => Status::InvalidKey,
            ServerError::Unavailable => Status::UnknownError,
            _ => Status::InvalidOperation,
        }
    }

    pub fn payload(&self) -> Value {
        json!([self.to_string()])
    }
}
