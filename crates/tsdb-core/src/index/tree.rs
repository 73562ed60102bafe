use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use super::{CompareOp, Index};
use crate::error::{Result, TsdbError};
use crate::schema::FieldValue;
use crate::snapshot;

/// Ordered index over a field, snapshotted to disk after every mutation.
///
/// Writes mark the in-memory tree stale; the next read reloads the snapshot.
pub struct TreeIndex {
    path: Option<PathBuf>,
    tree: BTreeMap<FieldValue, BTreeSet<String>>,
    stale: bool,
}

impl TreeIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut idx = Self {
            path: Some(path.clone()),
            tree: BTreeMap::new(),
            stale: false,
        };
        if path.exists() {
            idx.tree = Self::load(&path)?;
        } else {
            idx.persist()?;
            idx.stale = false;
        }
        Ok(idx)
    }

    /// An index that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tree: BTreeMap::new(),
            stale: false,
        }
    }

    fn load(path: &Path) -> Result<BTreeMap<FieldValue, BTreeSet<String>>> {
        let entries: Vec<(FieldValue, BTreeSet<String>)> = snapshot::load(path)?;
        Ok(entries.into_iter().collect())
    }

    fn persist(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            let entries: Vec<(&FieldValue, &BTreeSet<String>)> = self.tree.iter().collect();
            snapshot::save(path, &entries)?;
            self.stale = true;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        if self.stale {
            if let Some(path) = &self.path {
                self.tree = Self::load(path)?;
            }
            self.stale = false;
        }
        Ok(())
    }

    /// Distinct indexed values, ascending.
    pub fn values(&mut self) -> Result<Vec<FieldValue>> {
        self.refresh()?;
        Ok(self.tree.keys().cloned().collect())
    }

    fn union<'a>(sets: impl Iterator<Item = &'a BTreeSet<String>>) -> BTreeSet<String> {
        sets.flat_map(|s| s.iter().cloned()).collect()
    }
}

impl Index for TreeIndex {
    fn insert(&mut self, value: &FieldValue, pk: &str) -> Result<()> {
        self.refresh()?;
        let keys = self.tree.entry(value.clone()).or_default();
        if keys.contains(pk) {
            return Ok(());
        }
        keys.insert(pk.to_string());
        self.persist()
    }

    fn remove(&mut self, value: &FieldValue, pk: &str) -> Result<()> {
        self.refresh()?;
        let missing = || TsdbError::IndexEntryMissing {
            value: value.to_string(),
            pk: pk.to_string(),
        };
        let keys = self.tree.get_mut(value).ok_or_else(missing)?;
        if !keys.remove(pk) {
            return Err(missing());
        }
        if keys.is_empty() {
            self.tree.remove(value);
        }
        self.persist()
    }

    fn get_equal(&mut self, value: &FieldValue) -> Result<BTreeSet<String>> {
        self.refresh()?;
        Ok(self.tree.get(value).cloned().unwrap_or_default())
    }

    fn get_range(&mut self, op: CompareOp, value: &FieldValue) -> Result<BTreeSet<String>> {
        self.refresh()?;
        let keys = match op {
            CompareOp::Eq => return self.get_equal(value),
            CompareOp::Ne => Self::union(
                self.tree
                    .iter()
                    .filter(|(v, _)| *v != value)
                    .map(|(_, keys)| keys),
            ),
            CompareOp::Lt => Self::union(self.tree.range(..value).map(|(_, k)| k)),
            CompareOp::Le => Self::union(self.tree.range(..=value).map(|(_, k)| k)),
            CompareOp::Gt => Self::union(
                self.tree
                    .range((Bound::Excluded(value), Bound::Unbounded))
                    .map(|(_, k)| k),
            ),
            CompareOp::Ge => Self::union(self.tree.range(value..).map(|(_, k)| k)),
        };
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn filled(idx: &mut TreeIndex) {
        idx.insert(&FieldValue::Int(1), "a").unwrap();
        idx.insert(&FieldValue::Int(2), "b").unwrap();
        idx.insert(&FieldValue::Int(2), "c").unwrap();
        idx.insert(&FieldValue::Int(3), "d").unwrap();
    }

    #[test]
    fn range_queries_union_matching_values() {
        let mut idx = TreeIndex::in_memory();
        filled(&mut idx);
        let v = FieldValue::Int(2);
        assert_eq!(idx.get_equal(&v).unwrap(), keys(&["b", "c"]));
        assert_eq!(idx.get(CompareOp::Lt, &v).unwrap(), keys(&["a"]));
        assert_eq!(idx.get(CompareOp::Le, &v).unwrap(), keys(&["a", "b", "c"]));
        assert_eq!(idx.get(CompareOp::Gt, &v).unwrap(), keys(&["d"]));
        assert_eq!(idx.get(CompareOp::Ge, &v).unwrap(), keys(&["b", "c", "d"]));
        assert_eq!(idx.get(CompareOp::Ne, &v).unwrap(), keys(&["a", "d"]));
    }

    #[test]
    fn insert_is_idempotent_and_remove_is_strict() {
        let mut idx = TreeIndex::in_memory();
        idx.insert(&FieldValue::Float(0.5), "a").unwrap();
        idx.insert(&FieldValue::Float(0.5), "a").unwrap();
        assert_eq!(idx.get_equal(&FieldValue::Float(0.5)).unwrap().len(), 1);
        idx.remove(&FieldValue::Float(0.5), "a").unwrap();
        assert!(idx.values().unwrap().is_empty());
        assert!(matches!(
            idx.remove(&FieldValue::Float(0.5), "a"),
            Err(TsdbError::IndexEntryMissing { .. })
        ));
        idx.insert(&FieldValue::Float(0.5), "a").unwrap();
        assert!(idx.remove(&FieldValue::Float(0.5), "b").is_err());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("order.idx");
        {
            let mut idx = TreeIndex::open(&path).unwrap();
            filled(&mut idx);
            idx.remove(&FieldValue::Int(1), "a").unwrap();
        }
        let mut idx = TreeIndex::open(&path).unwrap();
        assert_eq!(
            idx.values().unwrap(),
            vec![FieldValue::Int(2), FieldValue::Int(3)]
        );
        assert_eq!(idx.get(CompareOp::Ge, &FieldValue::Int(0)).unwrap(), keys(&["b", "c", "d"]));
    }
}
