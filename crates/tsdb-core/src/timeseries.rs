use serde::{Deserialize, Serialize};

use crate::error::{Result, TsdbError};

/// A series of `(time, value)` observations.
///
/// Serialized as `[[times...], [values...]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(Vec<f64>, Vec<f64>)", into = "(Vec<f64>, Vec<f64>)")]
pub struct TimeSeries {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if times.len() != values.len() {
            return Err(TsdbError::Validation(format!(
                "series has {} times but {} values",
                times.len(),
                values.len()
            )));
        }
        Ok(Self { times, values })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation of the values.
    pub fn std(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        let mean = self.mean();
        let var = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.values.len() as f64;
        var.sqrt()
    }

    pub fn into_parts(self) -> (Vec<f64>, Vec<f64>) {
        (self.times, self.values)
    }
}

impl TryFrom<(Vec<f64>, Vec<f64>)> for TimeSeries {
    type Error = TsdbError;

    fn try_from((times, values): (Vec<f64>, Vec<f64>)) -> Result<Self> {
        Self::new(times, values)
    }
}

impl From<TimeSeries> for (Vec<f64>, Vec<f64>) {
    fn from(ts: TimeSeries) -> Self {
        ts.into_parts()
    }
}
