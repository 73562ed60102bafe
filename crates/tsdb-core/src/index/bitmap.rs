use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use roaring::RoaringBitmap;

use super::{CompareOp, Index};
use crate::error::{Result, TsdbError};
use crate::schema::FieldValue;

const TOMBSTONE: u8 = b'-';

/// Bitmap index for fields with a small declared set of values.
///
/// Each key owns one row position for the life of the index, reused across
/// overwrites and removals; every allowed value owns a bitmap of the
/// positions currently holding it. On disk each write appends one line of
/// `values.len()` `0`/`1` bytes followed by the key, and a removal appends
/// the same with dashes in place of the bits. Later lines win on reload.
pub struct BitmapIndex {
    path: PathBuf,
    file: File,
    values: Vec<FieldValue>,
    columns: Vec<RoaringBitmap>,
    rows: Vec<String>,
    positions: HashMap<String, u32>,
}

impl BitmapIndex {
    pub fn open(path: impl AsRef<Path>, values: Vec<FieldValue>) -> Result<Self> {
        if values.is_empty() {
            return Err(TsdbError::Validation("bitmap index needs allowed values".into()));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let mut idx = Self {
            path,
            file,
            columns: vec![RoaringBitmap::new(); values.len()],
            values,
            rows: Vec::new(),
            positions: HashMap::new(),
        };
        idx.reload()?;
        Ok(idx)
    }

    fn reload(&mut self) -> Result<()> {
        let width = self.values.len();
        let reader = BufReader::new(File::open(&self.path)?);
        for (lineno, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            if line.len() <= width {
                tracing::warn!(index = %self.path.display(), line = lineno + 1, "skipping short bitmap row");
                continue;
            }
            let (bits, key) = line.split_at(width);
            let Ok(key) = std::str::from_utf8(key) else {
                tracing::warn!(index = %self.path.display(), line = lineno + 1, "skipping non-utf8 key");
                continue;
            };
            if bits.iter().all(|b| *b == TOMBSTONE) {
                self.clear(key);
                continue;
            }
            match bits.iter().position(|b| *b == b'1') {
                Some(slot) => self.place(key, slot),
                None => self.clear(key),
            }
        }
        Ok(())
    }

    fn slot(&self, value: &FieldValue) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }

    fn clear(&mut self, key: &str) {
        if let Some(&pos) = self.positions.get(key) {
            for col in &mut self.columns {
                col.remove(pos);
            }
        }
    }

    fn place(&mut self, key: &str, slot: usize) {
        let pos = match self.positions.get(key) {
            Some(&pos) => {
                self.clear(key);
                pos
            }
            None => {
                let pos = self.rows.len() as u32;
                self.rows.push(key.to_string());
                self.positions.insert(key.to_string(), pos);
                pos
            }
        };
        self.columns[slot].insert(pos);
    }

    fn append_line(&mut self, bits: Vec<u8>, key: &str) -> Result<()> {
        let mut line = bits;
        line.extend_from_slice(key.as_bytes());
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }

    fn current_slot(&self, key: &str) -> Option<usize> {
        let pos = *self.positions.get(key)?;
        self.columns.iter().position(|c| c.contains(pos))
    }

    fn keys_of(&self, bitmap: &RoaringBitmap) -> BTreeSet<String> {
        bitmap
            .iter()
            .filter_map(|pos| self.rows.get(pos as usize).cloned())
            .collect()
    }

    pub fn allowed_values(&self) -> &[FieldValue] {
        &self.values
    }
}

impl Index for BitmapIndex {
    fn insert(&mut self, value: &FieldValue, pk: &str) -> Result<()> {
        let slot = self.slot(value).ok_or_else(|| {
            TsdbError::Validation(format!("value {value} is not one of the bitmap's allowed values"))
        })?;
        if pk.contains('\n') {
            return Err(TsdbError::Validation(format!("key {pk:?} contains a newline")));
        }
        if self.current_slot(pk) == Some(slot) {
            return Ok(());
        }
        let bits = (0..self.values.len())
            .map(|i| if i == slot { b'1' } else { b'0' })
            .collect();
        self.append_line(bits, pk)?;
        self.place(pk, slot);
        Ok(())
    }

    fn remove(&mut self, value: &FieldValue, pk: &str) -> Result<()> {
        let current = self.current_slot(pk);
        if current.is_none() || current != self.slot(value) {
            return Err(TsdbError::IndexEntryMissing {
                value: value.to_string(),
                pk: pk.to_string(),
            });
        }
        self.append_line(vec![TOMBSTONE; self.values.len()], pk)?;
        self.clear(pk);
        Ok(())
    }

    fn get_equal(&mut self, value: &FieldValue) -> Result<BTreeSet<String>> {
        Ok(match self.slot(value) {
            Some(slot) => self.keys_of(&self.columns[slot]),
            None => BTreeSet::new(),
        })
    }

    fn get_range(&mut self, op: CompareOp, value: &FieldValue) -> Result<BTreeSet<String>> {
        let mut hits = RoaringBitmap::new();
        for (v, col) in self.values.iter().zip(&self.columns) {
            if op.matches(v.cmp(value)) {
                hits |= col;
            }
        }
        Ok(self.keys_of(&hits))
    }

    fn close(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
