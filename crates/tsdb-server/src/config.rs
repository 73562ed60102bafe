use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use tsdb_core::{DbParams, DictDb, FieldDef, FieldType, PersistentDb, Schema, TimeSeriesDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Persistent,
    Memory,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "persistent" | "disk" => Ok(EngineKind::Persistent),
            "memory" | "dict" => Ok(EngineKind::Memory),
            other => Err(format!("unknown engine '{other}'")),
        }
    }
}

/// Server settings, read from `TSDB_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub name: String,
    pub pk_field: String,
    pub ts_length: usize,
    pub schema_path: Option<PathBuf>,
    pub engine: EngineKind,
    pub wal_refresh: usize,
    pub testing: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let params = DbParams::default();
        Self {
            listen: "127.0.0.1:9999".into(),
            data_dir: PathBuf::from("files"),
            name: "default".into(),
            pk_field: params.pk_field,
            ts_length: params.ts_length,
            schema_path: None,
            engine: EngineKind::Persistent,
            wal_refresh: params.refresh,
            testing: false,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparsable values fall back to
    /// the defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            listen: get("TSDB_LISTEN").unwrap_or(d.listen),
            data_dir: get("TSDB_DATA").map(PathBuf::from).unwrap_or(d.data_dir),
            name: get("TSDB_NAME").unwrap_or(d.name),
            pk_field: get("TSDB_PK_FIELD").unwrap_or(d.pk_field),
            ts_length: get("TSDB_TS_LENGTH")
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.ts_length),
            schema_path: get("TSDB_SCHEMA").map(PathBuf::from),
            engine: get("TSDB_ENGINE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.engine),
            wal_refresh: get("TSDB_WAL_REFRESH")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.wal_refresh),
            testing: get("TSDB_TESTING")
                .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(d.testing),
            log_dir: get("TSDB_LOG_DIR").map(PathBuf::from),
        }
    }

    pub fn params(&self) -> DbParams {
        DbParams {
            pk_field: self.pk_field.clone(),
            ts_length: self.ts_length,
            testing: self.testing,
            refresh: self.wal_refresh,
        }
    }

    pub fn load_schema(&self) -> anyhow::Result<Option<Schema>> {
        let Some(path) = &self.schema_path else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema {}", path.display()))?;
        let raw: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing schema {}", path.display()))?;
        let schema = Schema::from_json(&raw, self.pk_field.as_str())
            .with_context(|| format!("invalid schema {}", path.display()))?;
        Ok(Some(schema))
    }

    pub fn open_db(&self) -> anyhow::Result<Box<dyn TimeSeriesDb>> {
        let schema = self.load_schema()?;
        match self.engine {
            EngineKind::Persistent => {
                let db = PersistentDb::open(&self.data_dir, &self.name, schema, self.params())
                    .with_context(|| format!("opening database '{}' under {}", self.name, self.data_dir.display()))?;
                Ok(Box::new(db))
            }
            EngineKind::Memory => {
                let schema = match schema {
                    Some(s) => s,
                    None => Schema::new(vec![FieldDef::new(self.pk_field.as_str(), FieldType::String)], self.pk_field.as_str())?,
                };
                Ok(Box::new(DictDb::new(schema, self.ts_length)?))
            }
        }
    }
}
