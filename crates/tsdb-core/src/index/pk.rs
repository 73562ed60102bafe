use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{CompareOp, Index};
use crate::error::{Result, TsdbError};
use crate::schema::{FieldType, FieldValue};
use crate::snapshot;
use crate::wal::WriteLog;

/// Log entries accumulated before they are merged into the snapshot.
pub const DEFAULT_REFRESH: usize = 50;

const SNAPSHOT: &str = "pks.p";
const WRITE_LOG: &str = "writelog.idx";

/// Primary key to meta-record offset, kept as a snapshot plus a write log.
pub struct PkIndex {
    snapshot_path: PathBuf,
    log: WriteLog,
    map: BTreeMap<String, u64>,
    pending: usize,
    refresh: usize,
}

impl PkIndex {
    pub fn open(dir: impl AsRef<Path>, refresh: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let snapshot_path = dir.join(SNAPSHOT);
        let map = if snapshot_path.exists() {
            snapshot::load(&snapshot_path)?
        } else {
            BTreeMap::new()
        };
        let log = WriteLog::open(dir.join(WRITE_LOG))?;
        let mut idx = Self {
            snapshot_path,
            log,
            map,
            pending: 0,
            refresh: refresh.max(1),
        };
        let leftover = idx.log.replay()?;
        if !leftover.is_empty() {
            tracing::info!(entries = leftover.len(), "recovering primary keys from write log");
        }
        for (key, offset) in leftover {
            idx.map.insert(key, offset);
        }
        idx.merge()?;
        Ok(idx)
    }

    /// Folds the write log into the snapshot and truncates the log.
    pub fn merge(&mut self) -> Result<()> {
        snapshot::save(&self.snapshot_path, &self.map)?;
        self.log.truncate()?;
        tracing::debug!(keys = self.map.len(), merged = self.pending, "primary-key snapshot written");
        self.pending = 0;
        Ok(())
    }

    pub fn set(&mut self, key: &str, offset: u64) -> Result<()> {
        self.log.append(key, offset)?;
        self.map.insert(key.to_string(), offset);
        self.pending += 1;
        if self.pending >= self.refresh {
            self.merge()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.map.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Removal bypasses the log so recovery cannot resurrect the key.
    pub fn remove(&mut self, key: &str) -> Result<u64> {
        self.merge()?;
        let offset = self
            .map
            .remove(key)
            .ok_or_else(|| TsdbError::NotFound(key.to_string()))?;
        snapshot::save(&self.snapshot_path, &self.map)?;
        Ok(offset)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn offset_of(value: &FieldValue) -> Result<u64> {
        match value {
            FieldValue::Int(off) if *off >= 0 => Ok(*off as u64),
            other => Err(TsdbError::Type {
                field: "offset".into(),
                expected: FieldType::Int,
                found: other.to_string(),
            }),
        }
    }
}

/// Viewed as an index, the indexed value of a key is its record offset.
impl Index for PkIndex {
    fn insert(&mut self, value: &FieldValue, pk: &str) -> Result<()> {
        let offset = Self::offset_of(value)?;
        if PkIndex::get(self, pk) == Some(offset) {
            return Ok(());
        }
        self.set(pk, offset)
    }

    fn remove(&mut self, value: &FieldValue, pk: &str) -> Result<()> {
        let offset = Self::offset_of(value)?;
        if PkIndex::get(self, pk) != Some(offset) {
            return Err(TsdbError::IndexEntryMissing {
                value: value.to_string(),
                pk: pk.to_string(),
            });
        }
        PkIndex::remove(self, pk).map(|_| ())
    }

    fn get_equal(&mut self, value: &FieldValue) -> Result<BTreeSet<String>> {
        self.get_range(CompareOp::Eq, value)
    }

    fn get_range(&mut self, op: CompareOp, value: &FieldValue) -> Result<BTreeSet<String>> {
        let target = Self::offset_of(value)?;
        Ok(self
            .map
            .iter()
            .filter(|(_, off)| op.matches((**off).cmp(&target)))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn close(&mut self) -> Result<()> {
        self.merge()
    }
}
