//! Offset-addressed binary heap files for meta records and series payloads.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TsdbError};
use crate::schema::{FieldType, FieldValue, Schema, DELETED_FIELD, TS_OFFSET_FIELD};
use crate::snapshot;
use crate::timeseries::TimeSeries;

const META_HEAP: &str = "metaheap";
const META_HEAP_METADATA: &str = "metaheap_metadata.met";
const TS_HEAP: &str = "tsheap";
const TS_HEAP_METADATA: &str = "tsheap_metadata.met";

fn width(ty: FieldType) -> Result<usize> {
    match ty {
        FieldType::Bool => Ok(1),
        FieldType::Int | FieldType::Float => Ok(8),
        other => Err(TsdbError::Validation(format!(
            "{other} fields cannot be stored in fixed-width meta records"
        ))),
    }
}

fn format_char(ty: FieldType) -> char {
    match ty {
        FieldType::Bool => '?',
        FieldType::Int => 'q',
        _ => 'd',
    }
}

/// One packed column of a meta record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: FieldType,
    pub default: FieldValue,
    pub offset: usize,
}

/// A schema field mapped onto its value column and optional is-set column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Slot {
    name: String,
    column: usize,
    set_column: Option<usize>,
}

/// Byte layout of a meta record, derived from the schema's sorted scalar
/// fields followed by the internal `deleted` and `ts_offset` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaLayout {
    format: String,
    columns: Vec<Column>,
    slots: Vec<Slot>,
    record_len: usize,
}

impl MetaLayout {
    pub fn from_schema(schema: &Schema) -> Result<Self> {
        let mut layout = MetaLayout {
            format: String::from("<"),
            columns: Vec::new(),
            slots: Vec::new(),
            record_len: 0,
        };
        for f in schema.meta_fields() {
            let column = layout.push_column(&f.name, f.ty)?;
            let set_column = if f.ty == FieldType::Bool {
                None
            } else {
                Some(layout.push_column(&format!("{}_set", f.name), FieldType::Bool)?)
            };
            layout.slots.push(Slot {
                name: f.name.clone(),
                column,
                set_column,
            });
        }
        for (name, ty) in [(DELETED_FIELD, FieldType::Bool), (TS_OFFSET_FIELD, FieldType::Int)] {
            let column = layout.push_column(name, ty)?;
            layout.slots.push(Slot {
                name: name.to_string(),
                column,
                set_column: None,
            });
        }
        Ok(layout)
    }

    fn push_column(&mut self, name: &str, ty: FieldType) -> Result<usize> {
        let w = width(ty)?;
        let default = FieldValue::default_for(ty)
            .ok_or_else(|| TsdbError::Internal(format!("no default for {ty}")))?;
        self.columns.push(Column {
            name: name.to_string(),
            ty,
            default,
            offset: self.record_len,
        });
        self.format.push(format_char(ty));
        self.record_len += w;
        Ok(self.columns.len() - 1)
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// struct-style format string, e.g. `<d?q??q`.
    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn defaults(&self) -> Vec<FieldValue> {
        self.columns.iter().map(|c| c.default.clone()).collect()
    }

    fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Value of `name` in `record`, or `None` if it was never set.
    pub fn field(&self, record: &[FieldValue], name: &str) -> Option<FieldValue> {
        let slot = self.slot(name)?;
        if let Some(set) = slot.set_column {
            if record.get(set) != Some(&FieldValue::Bool(true)) {
                return None;
            }
        }
        record.get(slot.column).cloned()
    }

    pub fn set_field(&self, record: &mut [FieldValue], name: &str, value: FieldValue) -> Result<()> {
        let slot = self
            .slot(name)
            .ok_or_else(|| TsdbError::Internal(format!("field '{name}' is not in the meta layout")))?;
        let expected = self.columns[slot.column].ty;
        if value.field_type() != expected {
            return Err(TsdbError::Type {
                field: name.to_string(),
                expected,
                found: value.to_string(),
            });
        }
        record[slot.column] = value;
        if let Some(set) = slot.set_column {
            record[set] = FieldValue::Bool(true);
        }
        Ok(())
    }

    pub fn is_deleted(&self, record: &[FieldValue]) -> bool {
        self.field(record, DELETED_FIELD) == Some(FieldValue::Bool(true))
    }

    pub fn ts_offset(&self, record: &[FieldValue]) -> Result<u64> {
        match self.field(record, TS_OFFSET_FIELD) {
            Some(FieldValue::Int(off)) if off >= 0 => Ok(off as u64),
            other => Err(TsdbError::Internal(format!("corrupt series offset {other:?}"))),
        }
    }

    fn encode(&self, record: &[FieldValue]) -> Result<Vec<u8>> {
        if record.len() != self.columns.len() {
            return Err(TsdbError::Internal(format!(
                "record has {} values, layout has {} columns",
                record.len(),
                self.columns.len()
            )));
        }
        let mut buf = Vec::with_capacity(self.record_len);
        for (col, value) in self.columns.iter().zip(record) {
            match (col.ty, value) {
                (FieldType::Bool, FieldValue::Bool(b)) => buf.push(u8::from(*b)),
                (FieldType::Int, FieldValue::Int(i)) => buf.extend_from_slice(&i.to_le_bytes()),
                (FieldType::Float, FieldValue::Float(f)) => buf.extend_from_slice(&f.to_le_bytes()),
                (ty, v) => {
                    return Err(TsdbError::Type {
                        field: col.name.clone(),
                        expected: ty,
                        found: v.to_string(),
                    })
                }
            }
        }
        Ok(buf)
    }

    fn decode(&self, buf: &[u8]) -> Result<Vec<FieldValue>> {
        let mut out = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let at = col.offset;
            let value = match col.ty {
                FieldType::Bool => FieldValue::Bool(buf[at] != 0),
                FieldType::Int => FieldValue::Int(i64::from_le_bytes(read8(buf, at))),
                FieldType::Float => FieldValue::Float(f64::from_le_bytes(read8(buf, at))),
                other => return Err(TsdbError::Internal(format!("unexpected {other} column"))),
            };
            out.push(value);
        }
        Ok(out)
    }
}

fn read8(buf: &[u8], at: usize) -> [u8; 8] {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    b
}

fn open_rw(path: &Path) -> Result<(File, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// Drops a torn trailing record left by a crash mid-append.
fn aligned_end(len: u64, record_len: usize, name: &str) -> u64 {
    let rem = len % record_len as u64;
    if rem != 0 {
        tracing::warn!(heap = name, bytes = rem, "ignoring partial trailing record");
    }
    len - rem
}

/// Fixed-width meta records, updated in place.
pub struct MetaHeapFile {
    file: File,
    layout: MetaLayout,
    write_ptr: u64,
}

impl MetaHeapFile {
    pub fn open(dir: &Path, schema: &Schema) -> Result<Self> {
        let derived = MetaLayout::from_schema(schema)?;
        let meta_path = dir.join(META_HEAP_METADATA);
        let layout = if meta_path.exists() {
            let stored: MetaLayout = snapshot::load(&meta_path)?;
            if stored != derived {
                return Err(TsdbError::SchemaMismatch(format!(
                    "meta heap layout {} does not match schema layout {}",
                    stored.format, derived.format
                )));
            }
            stored
        } else {
            snapshot::save(&meta_path, &derived)?;
            derived
        };
        let (file, len) = open_rw(&dir.join(META_HEAP))?;
        let write_ptr = aligned_end(len, layout.record_len, META_HEAP);
        Ok(Self {
            file,
            layout,
            write_ptr,
        })
    }

    pub fn layout(&self) -> &MetaLayout {
        &self.layout
    }

    /// Writes `record` at `offset`, or appends when `offset` is `None`.
    /// Returns the offset used.
    pub fn encode_and_write(&mut self, record: &[FieldValue], offset: Option<u64>) -> Result<u64> {
        let bytes = self.layout.encode(record)?;
        let at = match offset {
            Some(off) => {
                self.check_offset(off)?;
                off
            }
            None => self.write_ptr,
        };
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(&bytes)?;
        if offset.is_none() {
            self.write_ptr += bytes.len() as u64;
        }
        Ok(at)
    }

    pub fn read_and_return(&mut self, offset: u64) -> Result<Vec<FieldValue>> {
        self.check_offset(offset)?;
        let mut buf = vec![0u8; self.layout.record_len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        self.layout.decode(&buf)
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        if offset >= self.write_ptr || offset % self.layout.record_len as u64 != 0 {
            return Err(TsdbError::Internal(format!("bad meta record offset {offset}")));
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TsHeapMeta {
    series_length: usize,
    record_len: usize,
}

/// Append-only store of fixed-length series: all times, then all values,
/// as little-endian `f64`.
pub struct TsHeapFile {
    file: File,
    series_length: usize,
    record_len: usize,
    write_ptr: u64,
}

impl TsHeapFile {
    pub fn open(dir: &Path, series_length: usize) -> Result<Self> {
        if series_length == 0 {
            return Err(TsdbError::Validation("series length must be positive".into()));
        }
        let expected = TsHeapMeta {
            series_length,
            record_len: 2 * series_length * 8,
        };
        let meta_path = dir.join(TS_HEAP_METADATA);
        if meta_path.exists() {
            let stored: TsHeapMeta = snapshot::load(&meta_path)?;
            if stored != expected {
                return Err(TsdbError::SchemaMismatch(format!(
                    "series heap holds length {}, database expects {}",
                    stored.series_length, series_length
                )));
            }
        } else {
            snapshot::save(&meta_path, &expected)?;
        }
        let (file, len) = open_rw(&dir.join(TS_HEAP))?;
        let write_ptr = aligned_end(len, expected.record_len, TS_HEAP);
        Ok(Self {
            file,
            series_length,
            record_len: expected.record_len,
            write_ptr,
        })
    }

    pub fn series_length(&self) -> usize {
        self.series_length
    }

    pub fn encode_and_write(&mut self, ts: &TimeSeries) -> Result<u64> {
        if ts.len() != self.series_length {
            return Err(TsdbError::LengthMismatch {
                expected: self.series_length,
                actual: ts.len(),
            });
        }
        let mut buf = Vec::with_capacity(self.record_len);
        for t in ts.times() {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        for v in ts.values() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        let at = self.write_ptr;
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(&buf)?;
        self.write_ptr += buf.len() as u64;
        Ok(at)
    }

    pub fn read_and_decode(&mut self, offset: u64) -> Result<TimeSeries> {
        if offset >= self.write_ptr || offset % self.record_len as u64 != 0 {
            return Err(TsdbError::Internal(format!("bad series offset {offset}")));
        }
        let mut buf = vec![0u8; self.record_len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        let floats: Vec<f64> = buf
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(read8(c, 0)))
            .collect();
        let (times, values) = floats.split_at(self.series_length);
        TimeSeries::new(times.to_vec(), values.to_vec())
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
