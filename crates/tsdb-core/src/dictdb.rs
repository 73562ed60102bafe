use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::engine::{check_pk, coerce_updates, Row, TimeSeriesDb};
use crate::error::{Result, TsdbError};
use crate::index::{Index, TreeIndex};
use crate::query::{self, Query, RowSource, Selection};
use crate::schema::{FieldType, FieldValue, Schema};
use crate::timeseries::TimeSeries;

/// In-memory engine with the same semantics as `PersistentDb`. Every
/// indexed field, bitmap or not, is served by an in-memory ordered index.
pub struct DictDb {
    schema: Schema,
    ts_length: usize,
    rows: BTreeMap<String, Row>,
    indexes: HashMap<String, TreeIndex>,
}

impl DictDb {
    pub fn new(schema: Schema, ts_length: usize) -> Result<Self> {
        if ts_length == 0 {
            return Err(TsdbError::Validation("series length must be positive".into()));
        }
        let indexes = schema
            .indexed_fields()
            .map(|(def, _)| (def.name.clone(), TreeIndex::in_memory()))
            .collect();
        Ok(Self {
            schema,
            ts_length,
            rows: BTreeMap::new(),
            indexes,
        })
    }

    fn row(&self, pk: &str) -> Result<&Row> {
        self.rows
            .get(pk)
            .ok_or_else(|| TsdbError::NotFound(pk.to_string()))
    }
}

impl TimeSeriesDb for DictDb {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn ts_length(&self) -> usize {
        self.ts_length
    }

    fn insert_ts(&mut self, pk: &str, ts: &TimeSeries) -> Result<()> {
        check_pk(pk)?;
        if self.rows.contains_key(pk) {
            return Err(TsdbError::DuplicateKey(pk.to_string()));
        }
        if ts.len() != self.ts_length {
            return Err(TsdbError::LengthMismatch {
                expected: self.ts_length,
                actual: ts.len(),
            });
        }
        // bool fields have no unset state
        let fields: BTreeMap<String, FieldValue> = self
            .schema
            .meta_fields()
            .into_iter()
            .filter(|f| f.ty == FieldType::Bool)
            .map(|f| (f.name.clone(), FieldValue::Bool(false)))
            .collect();
        for (name, value) in &fields {
            if let Some(idx) = self.indexes.get_mut(name) {
                idx.insert(value, pk)?;
            }
        }
        self.rows.insert(
            pk.to_string(),
            Row {
                pk: pk.to_string(),
                ts: ts.clone(),
                fields,
            },
        );
        Ok(())
    }

    fn upsert_meta(&mut self, pk: &str, meta: &Map<String, Value>) -> Result<()> {
        self.row(pk)?;
        let updates = coerce_updates(&self.schema, meta)?;
        let Some(row) = self.rows.get_mut(pk) else {
            return Err(TsdbError::NotFound(pk.to_string()));
        };
        for (field, value) in updates {
            if let Some(idx) = self.indexes.get_mut(&field) {
                match row.fields.get(&field) {
                    Some(prev) if *prev == value => {}
                    Some(prev) => idx.remove(prev, pk)?,
                    None => {}
                }
                idx.insert(&value, pk)?;
            }
            row.fields.insert(field, value);
        }
        Ok(())
    }

    fn delete_ts(&mut self, pk: &str) -> Result<()> {
        let row = self
            .rows
            .remove(pk)
            .ok_or_else(|| TsdbError::NotFound(pk.to_string()))?;
        for (field, value) in &row.fields {
            if let Some(idx) = self.indexes.get_mut(field) {
                idx.remove(value, pk)?;
            }
        }
        Ok(())
    }

    fn get(&mut self, pk: &str) -> Result<Row> {
        self.row(pk).cloned()
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
        self.rows.len()
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RowSource for DictDb {
    fn pk_field(&self) -> &str {
        self.schema.pk_field()
    }

    fn contains(&self, pk: &str) -> bool {
        self.rows.contains_key(pk)
    }

    fn live_keys(&self) -> BTreeSet<String> {
        self.rows.keys().cloned().collect()
    }

    fn meta(&mut self, pk: &str) -> Result<BTreeMap<String, FieldValue>> {
        Ok(self.row(pk)?.fields.clone())
    }

    fn series(&mut self, pk: &str) -> Result<TimeSeries> {
        Ok(self.row(pk)?.ts.clone())
    }

    fn index(&mut self, field: &str) -> Option<&mut dyn Index> {
        self.indexes.get_mut(field).map(|idx| idx as &mut dyn Index)
    }
}
