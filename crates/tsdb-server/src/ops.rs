//! Request and response envelopes exchanged with clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tsdb_core::TimeSeries;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Ok = 0,
    UnknownError = 1,
    InvalidOperation = 2,
    InvalidKey = 3,
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, String> {
        match code {
            0 => Ok(Status::Ok),
            1 => Ok(Status::UnknownError),
            2 => Ok(Status::InvalidOperation),
            3 => Ok(Status::InvalidKey),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

/// Every operation a client may send, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    InsertTs {
        pk: String,
        ts: TimeSeries,
    },
    DeleteTs {
        pk: String,
    },
    UpsertMeta {
        pk: String,
        md: Map<String, Value>,
    },
    Select {
        #[serde(default)]
        md: Map<String, Value>,
        #[serde(default)]
        fields: Option<Vec<String>>,
        #[serde(default)]
        additional: Option<Map<String, Value>>,
    },
    AugmentedSelect {
        proc: String,
        #[serde(default)]
        target: Option<Vec<String>>,
        #[serde(default)]
        arg: Value,
        #[serde(default)]
        md: Map<String, Value>,
        #[serde(default)]
        additional: Option<Map<String, Value>>,
    },
    AddTrigger {
        proc: String,
        onwhat: String,
        #[serde(default)]
        target: Option<Vec<String>>,
        #[serde(default)]
        arg: Value,
    },
    RemoveTrigger {
        proc: String,
        onwhat: String,
    },
    FindSimilar {
        arg: TimeSeries,
        #[serde(default)]
        vpkeys: Option<Vec<String>>,
    },
    MakeVpTree,
}

pub const OP_NAMES: &[&str] = &[
    "insert_ts",
    "delete_ts",
    "upsert_meta",
    "select",
    "augmented_select",
    "add_trigger",
    "remove_trigger",
    "find_similar",
    "make_vp_tree",
];

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::InsertTs { .. } => "insert_ts",
            Op::DeleteTs { .. } => "delete_ts",
            Op::UpsertMeta { .. } => "upsert_meta",
            Op::Select { .. } => "select",
            Op::AugmentedSelect { .. } => "augmented_select",
            Op::AddTrigger { .. } => "add_trigger",
            Op::RemoveTrigger { .. } => "remove_trigger",
            Op::FindSimilar { .. } => "find_similar",
            Op::MakeVpTree => "make_vp_tree",
        }
    }

    /// Decodes a request, telling a missing or unknown tag apart from
    /// ill-typed fields.
    pub fn from_json(msg: Value) -> Result<Self> {
        let tag = match msg.get("op") {
            Some(Value::String(tag)) => tag.clone(),
            Some(other) => return Err(ServerError::UnknownOp(other.to_string())),
            None => return Err(ServerError::Protocol(format!("not an operation: {msg}"))),
        };
        if !OP_NAMES.contains(&tag.as_str()) {
            return Err(ServerError::UnknownOp(tag));
        }
        serde_json::from_value(msg).map_err(|e| ServerError::Protocol(format!("bad '{tag}' request: {e}")))
    }
}

/// Response envelope: `{op, status, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub op: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub payload: Value,
}

impl Return {
    pub fn ok(op: &str, payload: Value) -> Self {
        Self {
            op: Some(op.to_string()),
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(op: Option<String>, err: &ServerError) -> Self {
        Self {
            op,
            status: err.status(),
            payload: err.payload(),
        }
    }
}
