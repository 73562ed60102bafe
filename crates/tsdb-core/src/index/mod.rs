//! Field-value indices mapping values to the primary keys holding them.

mod bitmap;
mod pk;
mod tree;

pub use bitmap::BitmapIndex;
pub use pk::{PkIndex, DEFAULT_REFRESH};
pub use tree::TreeIndex;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Result, TsdbError};
use crate::schema::FieldValue;

/// Comparison operators accepted in range clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Gt,
    Eq,
    Ne,
    Le,
    Ge,
}

impl CompareOp {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "<" => Ok(CompareOp::Lt),
            ">" => Ok(CompareOp::Gt),
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<=" => Ok(CompareOp::Le),
            ">=" => Ok(CompareOp::Ge),
            other => Err(TsdbError::Validation(format!("unknown operator '{other}'"))),
        }
    }

    /// Whether a stored value comparing as `ord` against the query value
    /// satisfies this operator.
    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Index: Send {
    /// Records that `pk` holds `value`. Re-inserting a present pair is a no-op.
    fn insert(&mut self, value: &FieldValue, pk: &str) -> Result<()>;

    /// Drops the `(value, pk)` pair; fails if it is not present.
    fn remove(&mut self, value: &FieldValue, pk: &str) -> Result<()>;

    fn get_equal(&mut self, value: &FieldValue) -> Result<BTreeSet<String>>;

    /// Union of the keys of every value satisfying `op` against `value`.
    fn get_range(&mut self, op: CompareOp, value: &FieldValue) -> Result<BTreeSet<String>>;

    fn get(&mut self, op: CompareOp, value: &FieldValue) -> Result<BTreeSet<String>> {
        match op {
            CompareOp::Eq => self.get_equal(value),
            _ => self.get_range(op, value),
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
