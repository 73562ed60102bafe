use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ServerError;
use crate::procs::StoredProcedure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    InsertTs,
    UpsertMeta,
    DeleteTs,
    Select,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::InsertTs => "insert_ts",
            TriggerEvent::UpsertMeta => "upsert_meta",
            TriggerEvent::DeleteTs => "delete_ts",
            TriggerEvent::Select => "select",
        }
    }
}

impl FromStr for TriggerEvent {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert_ts" => Ok(TriggerEvent::InsertTs),
            "upsert_meta" => Ok(TriggerEvent::UpsertMeta),
            "delete_ts" => Ok(TriggerEvent::DeleteTs),
            "select" => Ok(TriggerEvent::Select),
            other => Err(ServerError::UnknownEvent(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A procedure bound to an event. When `target` is set the procedure's
/// results are written back to the row under those field names.
#[derive(Clone)]
pub struct Trigger {
    pub proc: Arc<dyn StoredProcedure>,
    pub arg: Value,
    pub target: Option<Vec<String>>,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("proc", &self.proc.name())
            .field("arg", &self.arg)
            .field("target", &self.target)
            .finish()
    }
}

/// Triggers per event, in registration order.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    by_event: HashMap<TriggerEvent, Vec<Trigger>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: TriggerEvent, trigger: Trigger) {
        self.by_event.entry(event).or_default().push(trigger);
    }

    /// Drops every trigger running `proc` on `event` and returns how many
    /// were removed.
    pub fn remove(&mut self, event: TriggerEvent, proc: &str) -> usize {
        let Some(list) = self.by_event.get_mut(&event) else {
            return 0;
        };
        let before = list.len();
        list.retain(|t| t.proc.name() != proc);
        before - list.len()
    }

    pub fn for_event(&self, event: TriggerEvent) -> &[Trigger] {
        self.by_event.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }
}
