use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TsdbError};

/// Name of the field holding the series payload.
pub const TS_FIELD: &str = "ts";
/// Engine-internal tombstone flag appended to every meta record.
pub const DELETED_FIELD: &str = "deleted";
/// Engine-internal offset of the row's series in the series heap.
pub const TS_OFFSET_FIELD: &str = "ts_offset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Opaque,
}

impl FieldType {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(FieldType::String),
            "int" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "bool" => Ok(FieldType::Bool),
            "opaque" | "ts" => Ok(FieldType::Opaque),
            other => Err(TsdbError::Validation(format!("unknown field type '{other}'"))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Opaque => "opaque",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Ordered index supporting equality and range lookups.
    Tree,
    /// Per-value bit columns for low-cardinality fields.
    Bitmap,
}

impl IndexKind {
    fn from_json(v: &Value) -> Result<Option<Self>> {
        match v {
            Value::Null => Ok(None),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "tree" | "ordered" => Ok(Some(IndexKind::Tree)),
                "bitmap" => Ok(Some(IndexKind::Bitmap)),
                "none" => Ok(None),
                other => Err(TsdbError::Validation(format!("unknown index kind '{other}'"))),
            },
            // legacy numeric tags
            Value::Number(n) => match n.as_u64() {
                Some(1) => Ok(Some(IndexKind::Tree)),
                Some(2) => Ok(Some(IndexKind::Bitmap)),
                _ => Err(TsdbError::Validation(format!("unknown index kind {n}"))),
            },
            other => Err(TsdbError::Validation(format!("unknown index kind {other}"))),
        }
    }
}

/// A typed scalar stored in a meta record or used as an index key.
///
/// Values of different variants order by variant; within a schema a field
/// only ever holds one variant so this never affects query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Str(_) => FieldType::String,
        }
    }

    /// Zero value written into fresh meta records.
    pub fn default_for(ty: FieldType) -> Option<Self> {
        match ty {
            FieldType::Bool => Some(FieldValue::Bool(false)),
            FieldType::Int => Some(FieldValue::Int(0)),
            FieldType::Float => Some(FieldValue::Float(0.0)),
            FieldType::String => Some(FieldValue::Str(String::new())),
            FieldType::Opaque => None,
        }
    }

    /// Converts a JSON value into the declared type, rejecting anything that
    /// would need a lossy conversion. Integral floats such as `1.0` are
    /// accepted for int fields.
    pub fn from_json(field: &str, ty: FieldType, v: &Value) -> Result<Self> {
        let mismatch = || TsdbError::Type {
            field: field.to_string(),
            expected: ty,
            found: v.to_string(),
        };
        match ty {
            FieldType::String => v.as_str().map(|s| FieldValue::Str(s.to_string())).ok_or_else(mismatch),
            FieldType::Int => v
                .as_i64()
                .or_else(|| integral(v.as_f64()?))
                .map(FieldValue::Int)
                .ok_or_else(mismatch),
            FieldType::Float => v.as_f64().map(FieldValue::Float).ok_or_else(mismatch),
            FieldType::Bool => match v {
                Value::Bool(b) => Ok(FieldValue::Bool(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(FieldValue::Bool(false)),
                    Some(1) => Ok(FieldValue::Bool(true)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            FieldType::Opaque => Err(mismatch()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Str(s) => Value::String(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => 0,
            FieldValue::Int(_) => 1,
            FieldValue::Float(_) => 2,
            FieldValue::Str(_) => 3,
        }
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
            (FieldValue::Float(a), FieldValue::Float(b)) => a.total_cmp(b),
            (FieldValue::Str(a), FieldValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub index: Option<IndexKind>,
    /// Allowed values; required for bitmap-indexed fields.
    pub values: Option<Vec<FieldValue>>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            index: None,
            values: None,
        }
    }

    pub fn indexed(mut self, kind: IndexKind) -> Self {
        self.index = Some(kind);
        self
    }

    pub fn with_values(mut self, values: Vec<FieldValue>) -> Self {
        self.values = Some(values);
        self
    }

    /// Type-checks `v` and, when the field enumerates its values, checks
    /// membership.
    pub fn coerce(&self, v: &Value) -> Result<FieldValue> {
        let value = FieldValue::from_json(&self.name, self.ty, v)?;
        if let Some(allowed) = &self.values {
            if !allowed.contains(&value) {
                return Err(TsdbError::Validation(format!(
                    "value {value} is not allowed for field '{}'",
                    self.name
                )));
            }
        }
        Ok(value)
    }

    fn from_json(name: &str, spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| TsdbError::Validation(format!("field '{name}' must be an object")))?;
        let ty = obj
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TsdbError::Validation(format!("field '{name}' has no type")))?;
        let ty = FieldType::parse(ty)?;
        let index = match obj.get("index") {
            Some(v) => IndexKind::from_json(v)?,
            None => None,
        };
        let values = match obj.get("values") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| FieldValue::from_json(name, ty, v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(other) => {
                return Err(TsdbError::Validation(format!(
                    "values of field '{name}' must be a list, got {other}"
                )))
            }
        };
        Ok(Self {
            name: name.to_string(),
            ty,
            index,
            values,
        })
    }
}

/// Ordered field list with a designated primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
    pk_field: String,
}

impl Schema {
    pub fn new(mut fields: Vec<FieldDef>, pk_field: impl Into<String>) -> Result<Self> {
        let pk_field = pk_field.into();
        let mut seen = HashSet::new();
        for f in &fields {
            if f.name.is_empty() {
                return Err(TsdbError::Validation("field names must not be empty".into()));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(TsdbError::Validation(format!("duplicate field '{}'", f.name)));
            }
            if f.name == DELETED_FIELD || f.name == TS_OFFSET_FIELD {
                return Err(TsdbError::Validation(format!("field name '{}' is reserved", f.name)));
            }
            if f.name == TS_FIELD {
                if f.ty != FieldType::Opaque || f.index.is_some() {
                    return Err(TsdbError::Validation(
                        "field 'ts' must be an unindexed opaque field".into(),
                    ));
                }
                continue;
            }
            if f.ty == FieldType::Opaque {
                return Err(TsdbError::Validation(format!(
                    "only '{TS_FIELD}' may be opaque, not '{}'",
                    f.name
                )));
            }
            if f.name == pk_field {
                if f.ty != FieldType::String || f.index.is_some() || f.values.is_some() {
                    return Err(TsdbError::Validation(format!(
                        "primary key '{pk_field}' must be a plain string field"
                    )));
                }
                continue;
            }
            Self::check_values(f)?;
        }
        if !seen.contains(pk_field.as_str()) {
            return Err(TsdbError::Validation(format!(
                "primary key field '{pk_field}' is not in the schema"
            )));
        }
        if !seen.contains(TS_FIELD) {
            fields.push(FieldDef::new(TS_FIELD, FieldType::Opaque));
        }
        Ok(Self { fields, pk_field })
    }

    fn check_values(f: &FieldDef) -> Result<()> {
        match (&f.values, f.index) {
            (None, Some(IndexKind::Bitmap)) => Err(TsdbError::Validation(format!(
                "bitmap field '{}' needs a list of allowed values",
                f.name
            ))),
            (Some(values), _) => {
                if values.is_empty() {
                    return Err(TsdbError::Validation(format!(
                        "field '{}' has an empty value list",
                        f.name
                    )));
                }
                if let Some(bad) = values.iter().find(|v| v.field_type() != f.ty) {
                    return Err(TsdbError::Type {
                        field: f.name.clone(),
                        expected: f.ty,
                        found: bad.to_string(),
                    });
                }
                // bool fields are always set, starting at false
                if f.ty == FieldType::Bool && !values.contains(&FieldValue::Bool(false)) {
                    return Err(TsdbError::Validation(format!(
                        "bool field '{}' must allow false",
                        f.name
                    )));
                }
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    /// Parses either a list of `{name, type, index, values}` objects or a
    /// mapping of name to `{type, index, values}`.
    pub fn from_json(v: &Value, pk_field: impl Into<String>) -> Result<Self> {
        let fields = match v {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    let name = item
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| TsdbError::Validation("schema entry without a name".into()))?;
                    FieldDef::from_json(name, item)
                })
                .collect::<Result<Vec<_>>>()?,
            Value::Object(map) => map
                .iter()
                .map(|(name, spec)| FieldDef::from_json(name, spec))
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(TsdbError::Validation(format!(
                    "schema must be a list or an object, got {other}"
                )))
            }
        };
        Self::new(fields, pk_field)
    }

    pub fn pk_field(&self) -> &str {
        &self.pk_field
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Scalar fields stored in meta records, sorted by name.
    pub fn meta_fields(&self) -> Vec<&FieldDef> {
        let mut out: Vec<&FieldDef> = self
            .fields
            .iter()
            .filter(|f| f.name != self.pk_field && f.name != TS_FIELD)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn indexed_fields(&self) -> impl Iterator<Item = (&FieldDef, IndexKind)> {
        self.fields.iter().filter_map(|f| f.index.map(|k| (f, k)))
    }
}

fn integral(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}
