use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TsdbError};
use crate::heap::{MetaHeapFile, MetaLayout, TsHeapFile};
use crate::index::{BitmapIndex, Index, PkIndex, TreeIndex, DEFAULT_REFRESH};
use crate::query::{self, Query, RowSource, Selection};
use crate::schema::{
    FieldValue, IndexKind, Schema, DELETED_FIELD, TS_FIELD, TS_OFFSET_FIELD,
};
use crate::snapshot;
use crate::timeseries::TimeSeries;

/// Database name that only test runs may open.
pub const TESTING_NAME: &str = "testing";

const DB_METADATA: &str = "db_metadata.met";

/// A decoded row: the key, its series and the scalar fields that are set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub pk: String,
    pub ts: TimeSeries,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn to_json(&self, pk_field: &str) -> Value {
        let mut out: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        out.insert(pk_field.to_string(), Value::String(self.pk.clone()));
        out.insert(
            TS_FIELD.to_string(),
            Value::Array(vec![
                self.ts.times().iter().copied().map(Value::from).collect(),
                self.ts.values().iter().copied().map(Value::from).collect(),
            ]),
        );
        Value::Object(out)
    }
}

/// Operations shared by the persistent and in-memory engines.
pub trait TimeSeriesDb: Send {
    fn schema(&self) -> &Schema;

    fn ts_length(&self) -> usize;

    /// Adds a new row holding `ts` with default scalar values.
    fn insert_ts(&mut self, pk: &str, ts: &TimeSeries) -> Result<()>;

    /// Overwrites the given scalar fields of an existing row. Fields outside
    /// the schema are ignored.
    fn upsert_meta(&mut self, pk: &str, meta: &Map<String, Value>) -> Result<()>;

    fn delete_ts(&mut self, pk: &str) -> Result<()>;

    fn get(&mut self, pk: &str) -> Result<Row>;

    fn select(
        &mut self,
        filter: &Map<String, Value>,
        fields: Option<&[String]>,
        additional: Option<&Map<String, Value>>,
    ) -> Result<Selection>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&mut self) -> Result<()>;
}

pub(crate) fn check_pk(pk: &str) -> Result<()> {
    if pk.is_empty() || pk.contains('\n') {
        return Err(TsdbError::Validation(format!(
            "primary key {pk:?} must be non-empty and single-line"
        )));
    }
    Ok(())
}

/// Type-checks every schema field in `meta` before anything is written.
pub(crate) fn coerce_updates(
    schema: &Schema,
    meta: &Map<String, Value>,
) -> Result<Vec<(String, FieldValue)>> {
    let mut out = Vec::new();
    for (name, raw) in meta {
        if name == schema.pk_field() || name == TS_FIELD {
            continue;
        }
        match schema.field(name) {
            Some(def) => out.push((name.clone(), def.coerce(raw)?)),
            None => tracing::debug!(field = %name, "ignoring field outside the schema"),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DbParams {
    pub pk_field: String,
    pub ts_length: usize,
    /// Allows opening the reserved `testing` database.
    pub testing: bool,
    /// Primary-key log entries between snapshot merges.
    pub refresh: usize,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            pk_field: "pk".into(),
            ts_length: 1024,
            testing: false,
            refresh: DEFAULT_REFRESH,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DbMetadata {
    ts_length: usize,
    pk_field: String,
    schema: Schema,
}

/// Durable engine: one directory of heap, index and metadata files.
pub struct PersistentDb {
    path: PathBuf,
    schema: Schema,
    ts_length: usize,
    meta_heap: MetaHeapFile,
    ts_heap: TsHeapFile,
    pks: PkIndex,
    indexes: HashMap<String, Box<dyn Index>>,
    closed: bool,
}

impl PersistentDb {
    /// Opens `base/name`, creating it when `schema` is given and the
    /// directory holds no database yet. Passing `None` reuses the stored
    /// schema.
    pub fn open(
        base: impl AsRef<Path>,
        name: &str,
        schema: Option<Schema>,
        params: DbParams,
    ) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(TsdbError::Validation(format!("invalid database name {name:?}")));
        }
        if name == TESTING_NAME && !params.testing {
            return Err(TsdbError::Validation(format!(
                "database name '{TESTING_NAME}' is reserved for tests"
            )));
        }
        let path = base.as_ref().join(name);
        std::fs::create_dir_all(&path)?;

        let meta_path = path.join(DB_METADATA);
        let schema = if meta_path.exists() {
            let stored: DbMetadata = snapshot::load(&meta_path)?;
            if stored.ts_length != params.ts_length {
                return Err(TsdbError::SchemaMismatch(format!(
                    "database stores series of length {}, asked for {}",
                    stored.ts_length, params.ts_length
                )));
            }
            if stored.pk_field != params.pk_field {
                return Err(TsdbError::SchemaMismatch(format!(
                    "database keys on '{}', asked for '{}'",
                    stored.pk_field, params.pk_field
                )));
            }
            match schema {
                Some(given) if given != stored.schema => {
                    return Err(TsdbError::SchemaMismatch(
                        "schema differs from the one stored with the database".into(),
                    ))
                }
                _ => stored.schema,
            }
        } else {
            let schema = schema.ok_or_else(|| {
                TsdbError::Validation(format!("database '{name}' does not exist and no schema was given"))
            })?;
            if schema.pk_field() != params.pk_field {
                return Err(TsdbError::Validation(format!(
                    "schema keys on '{}', asked for '{}'",
                    schema.pk_field(),
                    params.pk_field
                )));
            }
            // validates storable field types before anything is written
            MetaLayout::from_schema(&schema)?;
            let meta = DbMetadata {
                ts_length: params.ts_length,
                pk_field: params.pk_field.clone(),
                schema,
            };
            snapshot::save(&meta_path, &meta)?;
            meta.schema
        };

        let meta_heap = MetaHeapFile::open(&path, &schema)?;
        let ts_heap = TsHeapFile::open(&path, params.ts_length)?;
        let pks = PkIndex::open(&path, params.refresh)?;

        let mut indexes: HashMap<String, Box<dyn Index>> = HashMap::new();
        for (def, kind) in schema.indexed_fields() {
            let idx: Box<dyn Index> = match kind {
                IndexKind::Tree => Box::new(TreeIndex::open(path.join(format!("{}.idx", def.name)))?),
                IndexKind::Bitmap => Box::new(BitmapIndex::open(
                    path.join(format!("{}_index.txt", def.name)),
                    def.values.clone().unwrap_or_default(),
                )?),
            };
            indexes.insert(def.name.clone(), idx);
        }

        tracing::info!(path = %path.display(), rows = pks.len(), "opened database");
        Ok(Self {
            path,
            schema,
            ts_length: params.ts_length,
            meta_heap,
            ts_heap,
            pks,
            indexes,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, pk: &str) -> Result<u64> {
        self.pks
            .get(pk)
            .ok_or_else(|| TsdbError::NotFound(pk.to_string()))
    }

    fn live_record(&mut self, pk: &str) -> Result<Vec<FieldValue>> {
        let off = self.offset(pk)?;
        let rec = self.meta_heap.read_and_return(off)?;
        if self.meta_heap.layout().is_deleted(&rec) {
            return Err(TsdbError::NotFound(pk.to_string()));
        }
        Ok(rec)
    }

    fn fields_of(&self, rec: &[FieldValue]) -> BTreeMap<String, FieldValue> {
        let layout = self.meta_heap.layout();
        self.schema
            .meta_fields()
            .into_iter()
            .filter_map(|f| layout.field(rec, &f.name).map(|v| (f.name.clone(), v)))
            .collect()
    }

    fn index_record(&mut self, pk: &str, rec: &[FieldValue]) -> Result<()> {
        let layout = self.meta_heap.layout();
        for (field, idx) in self.indexes.iter_mut() {
            if let Some(v) = layout.field(rec, field) {
                idx.insert(&v, pk)?;
            }
        }
        Ok(())
    }

    fn unindex_record(&mut self, pk: &str, rec: &[FieldValue]) -> Result<()> {
        let layout = self.meta_heap.layout();
        for (field, idx) in self.indexes.iter_mut() {
            if let Some(v) = layout.field(rec, field) {
                idx.remove(&v, pk)?;
            }
        }
        Ok(())
    }

    /// Closes the database and removes its directory.
    pub fn delete_database(mut self) -> Result<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.path)?;
        tracing::info!(path = %self.path.display(), "deleted database");
        Ok(())
    }
}

impl TimeSeriesDb for PersistentDb {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn ts_length(&self) -> usize {
        self.ts_length
    }

    fn insert_ts(&mut self, pk: &str, ts: &TimeSeries) -> Result<()> {
        check_pk(pk)?;
        if self.pks.contains(pk) {
            return Err(TsdbError::DuplicateKey(pk.to_string()));
        }
        if ts.len() != self.ts_length {
            return Err(TsdbError::LengthMismatch {
                expected: self.ts_length,
                actual: ts.len(),
            });
        }
        let ts_offset = self.ts_heap.encode_and_write(ts)?;
        let layout = self.meta_heap.layout();
        let mut rec = layout.defaults();
        layout.set_field(&mut rec, TS_OFFSET_FIELD, FieldValue::Int(ts_offset as i64))?;
        let off = self.meta_heap.encode_and_write(&rec, None)?;
        // the key is logged before any field index can name it
        self.pks.set(pk, off)?;
        self.index_record(pk, &rec)?;
        tracing::debug!(%pk, offset = off, "inserted series");
        Ok(())
    }

    fn upsert_meta(&mut self, pk: &str, meta: &Map<String, Value>) -> Result<()> {
        let off = self.offset(pk)?;
        let updates = coerce_updates(&self.schema, meta)?;
        if updates.is_empty() {
            return Ok(());
        }
        let old = self.live_record(pk)?;
        let layout = self.meta_heap.layout();
        let mut new = old.clone();
        for (field, value) in &updates {
            layout.set_field(&mut new, field, value.clone())?;
        }
        for (field, value) in &updates {
            if let Some(idx) = self.indexes.get_mut(field) {
                match layout.field(&old, field) {
                    Some(prev) if prev == *value => {}
                    Some(prev) => idx.remove(&prev, pk)?,
                    None => {}
                }
            }
        }
        self.meta_heap.encode_and_write(&new, Some(off))?;
        for (field, value) in &updates {
            if let Some(idx) = self.indexes.get_mut(field) {
                idx.insert(value, pk)?;
            }
        }
        Ok(())
    }

    fn delete_ts(&mut self, pk: &str) -> Result<()> {
        let off = self.offset(pk)?;
        let rec = self.live_record(pk)?;
        let mut tomb = rec.clone();
        self.meta_heap
            .layout()
            .set_field(&mut tomb, DELETED_FIELD, FieldValue::Bool(true))?;
        self.meta_heap.encode_and_write(&tomb, Some(off))?;
        self.unindex_record(pk, &rec)?;
        self.pks.remove(pk)?;
        tracing::debug!(%pk, "deleted series");
        Ok(())
    }

    fn get(&mut self, pk: &str) -> Result<Row> {
        let rec = self.live_record(pk)?;
        let ts_offset = self.meta_heap.layout().ts_offset(&rec)?;
        let ts = self.ts_heap.read_and_decode(ts_offset)?;
        Ok(Row {
            pk: pk.to_string(),
            ts,
            fields: self.fields_of(&rec),
        })
    }

    fn select(
        &mut self,
        filter: &Map<String, Value>,
        fields: Option<&[String]>,
        additional: Option<&Map<String, Value>>,
    ) -> Result<Selection> {
        let q = Query::parse(&self.schema, filter, fields, additional)?;
        query::execute(self, &q)
    }

    fn len(&self) -> usize {
        self.pks.len()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.pks.close()?;
        for idx in self.indexes.values_mut() {
            idx.close()?;
        }
        self.meta_heap.close()?;
        self.ts_heap.close()?;
        self.closed = true;
        tracing::info!(path = %self.path.display(), "closed database");
        Ok(())
    }
}

impl RowSource for PersistentDb {
    fn pk_field(&self) -> &str {
        self.schema.pk_field()
    }

    fn contains(&self, pk: &str) -> bool {
        self.pks.contains(pk)
    }

    fn live_keys(&self) -> BTreeSet<String> {
        self.pks.keys().cloned().collect()
    }

    fn meta(&mut self, pk: &str) -> Result<BTreeMap<String, FieldValue>> {
        let rec = self.live_record(pk)?;
        Ok(self.fields_of(&rec))
    }

    fn series(&mut self, pk: &str) -> Result<TimeSeries> {
        let rec = self.live_record(pk)?;
        let ts_offset = self.meta_heap.layout().ts_offset(&rec)?;
        self.ts_heap.read_and_decode(ts_offset)
    }

    fn index(&mut self, field: &str) -> Option<&mut dyn Index> {
        self.indexes.get_mut(field).map(|idx| idx.as_mut() as &mut dyn Index)
    }
}

impl Drop for PersistentDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing database on drop failed: {e}");
        }
    }
}
