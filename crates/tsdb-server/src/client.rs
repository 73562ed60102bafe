use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tsdb_core::TimeSeries;

use crate::error::{Result, ServerError};
use crate::ops::{Op, Return, Status};
use crate::serialization::{read_frame, write_frame};

/// Sends one operation per connection to a server.
#[derive(Debug, Clone)]
pub struct TsdbClient {
    addr: String,
}

impl TsdbClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn insert_ts(&self, pk: &str, ts: &TimeSeries) -> Result<(Status, Value)> {
        self.send(&Op::InsertTs {
            pk: pk.to_string(),
            ts: ts.clone(),
        })
        .await
    }

    pub async fn delete_ts(&self, pk: &str) -> Result<(Status, Value)> {
        self.send(&Op::DeleteTs { pk: pk.to_string() }).await
    }

    pub async fn upsert_meta(&self, pk: &str, md: Map<String, Value>) -> Result<(Status, Value)> {
        self.send(&Op::UpsertMeta {
            pk: pk.to_string(),
            md,
        })
        .await
    }

    pub async fn select(
        &self,
        md: Map<String, Value>,
        fields: Option<Vec<String>>,
        additional: Option<Map<String, Value>>,
    ) -> Result<(Status, Value)> {
        self.send(&Op::Select {
            md,
            fields,
            additional,
        })
        .await
    }

    pub async fn augmented_select(
        &self,
        proc: &str,
        target: Option<Vec<String>>,
        arg: Value,
        md: Map<String, Value>,
        additional: Option<Map<String, Value>>,
    ) -> Result<(Status, Value)> {
        self.send(&Op::AugmentedSelect {
            proc: proc.to_string(),
            target,
            arg,
            md,
            additional,
        })
        .await
    }

    pub async fn add_trigger(
        &self,
        proc: &str,
        onwhat: &str,
        target: Option<Vec<String>>,
        arg: Value,
    ) -> Result<(Status, Value)> {
        self.send(&Op::AddTrigger {
            proc: proc.to_string(),
            onwhat: onwhat.to_string(),
            target,
            arg,
        })
        .await
    }

    pub async fn remove_trigger(&self, proc: &str, onwhat: &str) -> Result<(Status, Value)> {
        self.send(&Op::RemoveTrigger {
            proc: proc.to_string(),
            onwhat: onwhat.to_string(),
        })
        .await
    }

    pub async fn find_similar(&self, arg: &TimeSeries, vpkeys: Option<Vec<String>>) -> Result<(Status, Value)> {
        self.send(&Op::FindSimilar {
            arg: arg.clone(),
            vpkeys,
        })
        .await
    }

    pub async fn make_vp_tree(&self) -> Result<(Status, Value)> {
        self.send(&Op::MakeVpTree).await
    }

    pub async fn send(&self, op: &Op) -> Result<(Status, Value)> {
        let ret = self.round_trip(op).await?;
        Ok((ret.status, ret.payload))
    }

    /// Writes any serializable request as one frame and decodes the reply.
    pub async fn round_trip<T: serde::Serialize + ?Sized>(&self, msg: &T) -> Result<Return> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_frame(&mut stream, msg).await?;
        read_frame(&mut stream)
            .await?
            .ok_or_else(|| ServerError::Protocol("server closed the connection without replying".into()))
    }
}
