// External crates
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// Internal modules
use crate::daily::step_1_indicator_engine::FeatureTable;
use crate::error::{ForecastError, Result};

/// Per-feature min-max scaling state
///
/// Fitted once over a whole feature table and never refitted. Only the
/// `close` pair is needed to bring predictions back to price scale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MinMaxScaler {
    pub columns: Vec<String>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub close_index: usize,
}

impl MinMaxScaler {
    /// Fit over every row of `table`
    pub fn fit(table: &FeatureTable) -> Result<Self> {
        if table.is_empty() {
            return Err(ForecastError::InsufficientData(
                "cannot fit a scaler on an empty feature table".to_string(),
            ));
        }

        let values = table.values();
        let mut min = Vec::with_capacity(table.num_features());
        let mut max = Vec::with_capacity(table.num_features());
        for column in values.columns() {
            min.push(column.iter().copied().fold(f64::INFINITY, f64::min));
            max.push(column.iter().copied().fold(f64::NEG_INFINITY, f64::max));
        }

        Ok(Self {
            columns: table.columns().to_vec(),
            min,
            max,
            close_index: table.close_index(),
        })
    }

    pub fn num_features(&self) -> usize {
        self.columns.len()
    }

    /// Scale every feature to [0, 1]; zero-range features map to 0
    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureTable> {
        if table.columns() != self.columns.as_slice() {
            return Err(ForecastError::ShapeMismatch {
                expected: self.num_features(),
                actual: table.num_features(),
            });
        }

        let mut scaled = Array2::<f64>::zeros(table.values().raw_dim());
        for ((row, col), value) in table.values().indexed_iter() {
            scaled[[row, col]] = self.scale_value(col, *value);
        }
        table.with_values(scaled)
    }

    fn scale_value(&self, col: usize, value: f64) -> f64 {
        let range = self.max[col] - self.min[col];
        if range == 0.0 {
            0.0
        } else {
            (value - self.min[col]) / range
        }
    }

    /// Map scaled close predictions back to prices
    pub fn inverse_transform_close(&self, scaled: &[f64]) -> Vec<f64> {
        let min = self.min[self.close_index];
        let range = self.max[self.close_index] - min;
        scaled.iter().map(|v| v * range + min).collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
