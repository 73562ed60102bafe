//! Filter, sort, limit and projection shared by both engines.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::error::{Result, TsdbError};
use crate::index::{CompareOp, Index};
use crate::schema::{FieldType, FieldValue, Schema, TS_FIELD};
use crate::timeseries::TimeSeries;

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Pk { op: CompareOp, key: String },
    Field { field: String, op: CompareOp, value: FieldValue },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// One empty map per key.
    KeysOnly,
    /// Every set field except the series, plus the primary key.
    AllFields,
    Fields(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

/// A validated select request.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub clauses: Vec<Clause>,
    pub projection: Projection,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
}

/// Keys in result order with one field map per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub keys: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Ordered `{pk: fields}` mapping.
    pub fn into_map(self) -> Map<String, Value> {
        self.keys
            .into_iter()
            .zip(self.rows)
            .map(|(k, row)| (k, Value::Object(row)))
            .collect()
    }
}

impl Query {
    pub fn parse(
        schema: &Schema,
        filter: &Map<String, Value>,
        fields: Option<&[String]>,
        additional: Option<&Map<String, Value>>,
    ) -> Result<Self> {
        let mut clauses = Vec::new();
        for (field, cond) in filter {
            if field == schema.pk_field() {
                for (op, v) in split_condition(field, cond)? {
                    let key = v.as_str().ok_or_else(|| TsdbError::Type {
                        field: field.clone(),
                        expected: FieldType::String,
                        found: v.to_string(),
                    })?;
                    clauses.push(Clause::Pk {
                        op,
                        key: key.to_string(),
                    });
                }
                continue;
            }
            let Some(def) = schema.field(field) else {
                tracing::debug!(%field, "ignoring filter on unknown field");
                continue;
            };
            if field == TS_FIELD {
                return Err(TsdbError::Validation("cannot filter on the series field".into()));
            }
            for (op, v) in split_condition(field, cond)? {
                clauses.push(Clause::Field {
                    field: field.clone(),
                    op,
                    value: FieldValue::from_json(field, def.ty, v)?,
                });
            }
        }

        let projection = match fields {
            None => Projection::KeysOnly,
            Some([]) => Projection::AllFields,
            Some(list) => Projection::Fields(list.to_vec()),
        };

        let (sort, limit) = match additional {
            Some(opts) => (parse_sort(schema, opts)?, parse_limit(opts)?),
            None => (None, None),
        };

        Ok(Self {
            clauses,
            projection,
            sort,
            limit,
        })
    }
}

/// A literal means equality; an object maps operators to operands.
fn split_condition<'a>(field: &str, cond: &'a Value) -> Result<Vec<(CompareOp, &'a Value)>> {
    match cond {
        Value::Object(ops) => {
            if ops.is_empty() {
                return Err(TsdbError::Validation(format!("empty condition for field '{field}'")));
            }
            ops.iter()
                .map(|(op, v)| Ok((CompareOp::parse(op)?, v)))
                .collect()
        }
        literal => Ok(vec![(CompareOp::Eq, literal)]),
    }
}

fn parse_sort(schema: &Schema, opts: &Map<String, Value>) -> Result<Option<SortSpec>> {
    let Some(raw) = opts.get("sort_by") else {
        return Ok(None);
    };
    let raw = raw
        .as_str()
        .ok_or_else(|| TsdbError::Validation(format!("sort_by must be a string, got {raw}")))?;
    let (descending, field) = if let Some(field) = raw.strip_prefix('+') {
        (false, field)
    } else if let Some(field) = raw.strip_prefix('-') {
        (true, field)
    } else {
        return Err(TsdbError::Validation(format!(
            "sort_by '{raw}' must start with '+' or '-'"
        )));
    };
    if !schema.contains(field) {
        return Err(TsdbError::Validation(format!("cannot sort on unknown field '{field}'")));
    }
    if field == TS_FIELD {
        return Err(TsdbError::Validation("cannot sort on the series field".into()));
    }
    Ok(Some(SortSpec {
        field: field.to_string(),
        descending,
    }))
}

fn parse_limit(opts: &Map<String, Value>) -> Result<Option<usize>> {
    let Some(raw) = opts.get("limit") else {
        return Ok(None);
    };
    let bad = || TsdbError::Validation(format!("limit {raw} is not a non-negative integer"));
    let n = match raw {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(u), _) => u,
            (None, Some(f)) if f.is_finite() && f >= 0.0 => f.trunc() as u64,
            _ => return Err(bad()),
        },
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| bad())?,
        _ => return Err(bad()),
    };
    usize::try_from(n).map(Some).map_err(|_| bad())
}

/// Read access an engine offers to the evaluator.
pub(crate) trait RowSource {
    fn pk_field(&self) -> &str;
    fn contains(&self, pk: &str) -> bool;
    fn live_keys(&self) -> BTreeSet<String>;
    /// Set scalar fields of a live row.
    fn meta(&mut self, pk: &str) -> Result<BTreeMap<String, FieldValue>>;
    fn series(&mut self, pk: &str) -> Result<TimeSeries>;
    fn index(&mut self, field: &str) -> Option<&mut dyn Index>;
}

type MetaCache = HashMap<String, BTreeMap<String, FieldValue>>;

fn cached_meta<'c, S: RowSource + ?Sized>(
    src: &mut S,
    cache: &'c mut MetaCache,
    pk: &str,
) -> Result<&'c BTreeMap<String, FieldValue>> {
    if !cache.contains_key(pk) {
        let meta = src.meta(pk)?;
        cache.insert(pk.to_string(), meta);
    }
    cache
        .get(pk)
        .ok_or_else(|| TsdbError::Internal(format!("meta cache lost '{pk}'")))
}

pub(crate) fn execute<S: RowSource + ?Sized>(src: &mut S, query: &Query) -> Result<Selection> {
    let mut cache = MetaCache::new();

    // an equality clause on the primary key pins the candidate set
    let pinned = query.clauses.iter().find_map(|c| match c {
        Clause::Pk {
            op: CompareOp::Eq,
            key,
        } => Some(key.clone()),
        _ => None,
    });
    let mut keys: BTreeSet<String> = match pinned {
        Some(key) if src.contains(&key) => BTreeSet::from([key]),
        Some(_) => BTreeSet::new(),
        None => src.live_keys(),
    };

    for clause in &query.clauses {
        if keys.is_empty() {
            break;
        }
        match clause {
            Clause::Pk { op, key } => keys.retain(|k| op.matches(k.as_str().cmp(key.as_str()))),
            Clause::Field { field, op, value } => {
                let indexed = match src.index(field) {
                    Some(idx) => Some(idx.get(*op, value)?),
                    None => None,
                };
                match indexed {
                    Some(hits) => keys.retain(|k| hits.contains(k)),
                    None => {
                        let mut kept = BTreeSet::new();
                        for k in keys {
                            let meta = cached_meta(src, &mut cache, &k)?;
                            if meta.get(field).is_some_and(|v| op.matches(v.cmp(value))) {
                                kept.insert(k);
                            }
                        }
                        keys = kept;
                    }
                }
            }
        }
    }

    let mut ordered: Vec<String> = keys.into_iter().collect();
    if let Some(sort) = &query.sort {
        let mut decorated = Vec::with_capacity(ordered.len());
        for k in ordered {
            let v = if sort.field == src.pk_field() {
                Some(FieldValue::Str(k.clone()))
            } else {
                cached_meta(src, &mut cache, &k)?.get(&sort.field).cloned()
            };
            decorated.push((k, v));
        }
        decorated.sort_by(|(_, a), (_, b)| {
            let ord: Ordering = a.cmp(b);
            if sort.descending {
                ord.reverse()
            } else {
                ord
            }
        });
        ordered = decorated.into_iter().map(|(k, _)| k).collect();
    }
    if let Some(limit) = query.limit {
        ordered.truncate(limit);
    }

    let pk_field = src.pk_field().to_string();
    let mut rows = Vec::with_capacity(ordered.len());
    for k in &ordered {
        let row = match &query.projection {
            Projection::KeysOnly => Map::new(),
            Projection::AllFields => {
                let mut row: Map<String, Value> = cached_meta(src, &mut cache, k)?
                    .iter()
                    .map(|(f, v)| (f.clone(), v.to_json()))
                    .collect();
                row.insert(pk_field.clone(), Value::String(k.clone()));
                row
            }
            Projection::Fields(list) => {
                let mut row = Map::new();
                for f in list {
                    if *f == pk_field {
                        row.insert(f.clone(), Value::String(k.clone()));
                    } else if f == TS_FIELD {
                        row.insert(f.clone(), serde_json::to_value(src.series(k)?)?);
                    } else if let Some(v) = cached_meta(src, &mut cache, k)?.get(f) {
                        row.insert(f.clone(), v.to_json());
                    }
                }
                row
            }
        };
        rows.push(row);
    }

    Ok(Selection { keys: ordered, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, IndexKind};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(
            vec![
                FieldDef::new("pk", FieldType::String),
                FieldDef::new("order", FieldType::Int).indexed(IndexKind::Tree),
                FieldDef::new("mean", FieldType::Float),
            ],
            "pk",
        )
        .unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_literals_and_ranges() {
        let q = Query::parse(
            &schema(),
            &obj(json!({"order": {">=": 1, "<": 4}, "mean": 2.5, "bogus": 1})),
            None,
            None,
        )
        .unwrap();
        assert_eq!(q.clauses.len(), 3);
        assert!(q.clauses.contains(&Clause::Field {
            field: "mean".into(),
            op: CompareOp::Eq,
            value: FieldValue::Float(2.5),
        }));
        assert_eq!(q.projection, Projection::KeysOnly);
    }

    #[test]
    fn pk_and_projection_forms() {
        let empty: [String; 0] = [];
        let q = Query::parse(&schema(), &obj(json!({"pk": "one"})), Some(&empty), None).unwrap();
        assert_eq!(
            q.clauses,
            vec![Clause::Pk {
                op: CompareOp::Eq,
                key: "one".into()
            }]
        );
        assert_eq!(q.projection, Projection::AllFields);
        assert!(Query::parse(&schema(), &obj(json!({"pk": 3})), None, None).is_err());
        assert!(Query::parse(&schema(), &obj(json!({"ts": 3})), None, None).is_err());
        assert!(Query::parse(&schema(), &obj(json!({"order": "x"})), None, None).is_err());
    }

    #[test]
    fn sort_and_limit_options() {
        let s = schema();
        let q = Query::parse(&s, &Map::new(), None, Some(&obj(json!({"sort_by": "-order", "limit": "2"}))))
            .unwrap();
        assert_eq!(
            q.sort,
            Some(SortSpec {
                field: "order".into(),
                descending: true
            })
        );
        assert_eq!(q.limit, Some(2));
        let q = Query::parse(&s, &Map::new(), None, Some(&obj(json!({"limit": 3.9})))).unwrap();
        assert_eq!(q.limit, Some(3));
        for bad in [
            json!({"sort_by": "order"}),
            json!({"sort_by": "+nope"}),
            json!({"sort_by": ""}),
            json!({"limit": "ten"}),
            json!({"limit": -1}),
            json!({"limit": [1]}),
        ] {
            assert!(
                matches!(Query::parse(&s, &Map::new(), None, Some(&obj(bad.clone()))), Err(TsdbError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }
}
