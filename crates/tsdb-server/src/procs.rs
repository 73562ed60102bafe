//! Stored procedures run by augmented selects and triggers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tsdb_core::{Row, TimeSeries};

use crate::error::{Result, ServerError};

/// Weight applied to cross-correlations inside the kernel.
const KERNEL_MULT: f64 = 5.0;
/// Kernel gaps below this are rounding noise, which `sqrt` would inflate.
const KERNEL_EPS: f64 = 1e-12;

#[async_trait]
pub trait StoredProcedure: Send + Sync {
    fn name(&self) -> &str;

    /// Computes the procedure's values for one row.
    fn proc_main(&self, pk: &str, row: &Row, arg: &Value) -> Result<Vec<Value>>;

    /// Entry point for triggers.
    async fn main(&self, pk: &str, row: &Row, arg: &Value) -> Result<Vec<Value>> {
        self.proc_main(pk, row, arg)
    }
}

/// `[mean, std]` of the row's series.
pub struct Stats;

impl StoredProcedure for Stats {
    fn name(&self) -> &str {
        "stats"
    }

    fn proc_main(&self, _pk: &str, row: &Row, _arg: &Value) -> Result<Vec<Value>> {
        Ok(vec![float(row.ts.mean()), float(row.ts.std())])
    }
}

/// `[d]`, the kernel-correlation distance from the row's series to the
/// series passed as `arg`.
pub struct Corr;

impl StoredProcedure for Corr {
    fn name(&self) -> &str {
        "corr"
    }

    fn proc_main(&self, pk: &str, row: &Row, arg: &Value) -> Result<Vec<Value>> {
        let other: TimeSeries = serde_json::from_value(arg.clone())
            .map_err(|e| ServerError::Procedure(format!("corr expects a series argument: {e}")))?;
        if other.len() != row.ts.len() {
            return Err(ServerError::Procedure(format!(
                "cannot correlate '{pk}' ({} points) with a series of {} points",
                row.ts.len(),
                other.len()
            )));
        }
        Ok(vec![float(kernel_distance(row.ts.values(), other.values()))])
    }
}

pub struct Junk;

impl StoredProcedure for Junk {
    fn name(&self) -> &str {
        "junk"
    }

    fn proc_main(&self, _pk: &str, _row: &Row, _arg: &Value) -> Result<Vec<Value>> {
        Ok(vec![Value::Null])
    }
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Shifts and scales to zero mean and unit (population) deviation. A flat
/// series only gets centred.
pub fn standardize(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    if values.is_empty() {
        return Vec::new();
    }
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std == 0.0 {
        return values.iter().map(|v| v - mean).collect();
    }
    values.iter().map(|v| (v - mean) / std).collect()
}

/// `cc[k] = (1/n) Σ x[(i + k) mod n] · y[i]`, computed directly in O(n²).
/// Series lengths are fixed per database and small enough that this stays
/// cheaper than pulling in an FFT.
fn cross_correlation(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    (0..n)
        .map(|k| (0..n).map(|i| x[(i + k) % n] * y[i]).sum::<f64>() / n as f64)
        .collect()
}

fn kernel_sum(x: &[f64], y: &[f64]) -> f64 {
    cross_correlation(x, y)
        .into_iter()
        .map(|c| (KERNEL_MULT * c).exp())
        .sum()
}

/// Distance between two already standardized series of equal length.
pub fn standardized_distance(x: &[f64], y: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let kernel = kernel_sum(x, y) / (kernel_sum(x, x) * kernel_sum(y, y)).sqrt();
    let gap = 1.0 - kernel;
    if gap < KERNEL_EPS {
        return 0.0;
    }
    (2.0 * gap).sqrt()
}

pub fn kernel_distance(x: &[f64], y: &[f64]) -> f64 {
    standardized_distance(&standardize(x), &standardize(y))
}

/// Procedures addressable by name.
#[derive(Clone)]
pub struct ProcRegistry {
    procs: HashMap<String, Arc<dyn StoredProcedure>>,
}

impl ProcRegistry {
    pub fn empty() -> Self {
        Self {
            procs: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register(Arc::new(Stats));
        reg.register(Arc::new(Corr));
        reg.register(Arc::new(Junk));
        reg
    }

    /// Adds `proc`, replacing any procedure of the same name.
    pub fn register(&mut self, proc: Arc<dyn StoredProcedure>) {
        self.procs.insert(proc.name().to_string(), proc);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StoredProcedure>> {
        self.procs
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::UnknownProcedure(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProcRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
