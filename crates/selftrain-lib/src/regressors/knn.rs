//! k-nearest-neighbour mean on standardized features

use super::{validate_training_data, Hyperparameters, ModelError, Regressor, Standardizer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_K: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnRegressor {
    k: usize,
    scaler: Standardizer,
    rows: Vec<Vec<f64>>,
    targets: Vec<f64>,
}

impl KnnRegressor {
    pub const KIND: &'static str = "knn";

    pub fn new(_params: &Hyperparameters) -> Self {
        Self {
            k: DEFAULT_K,
            scaler: Standardizer::default(),
            rows: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl Regressor for KnnRegressor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<(), ModelError> {
        let width = validate_training_data(x, y)?;
        self.scaler = Standardizer::fit(x, width);
        self.rows = x.iter().map(|row| self.scaler.transform(row)).collect();
        self.targets = y.to_vec();
        Ok(())
    }

    fn predict(&self, row: &[f64]) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        let query = self.scaler.transform(row);
        let mut distances: Vec<(f64, f64)> = self
            .rows
            .iter()
            .zip(&self.targets)
            .map(|(r, t)| {
                let d: f64 = r.iter().zip(&query).map(|(a, b)| (a - b).powi(2)).sum();
                (d, *t)
            })
            .collect();
        distances.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let k = self.k.min(distances.len()).max(1);
        distances.iter().take(k).map(|(_, t)| t).sum::<f64>() / k as f64
    }

    fn to_state(&self) -> Result<Value, ModelError> {
        Ok(serde_json::to_value(self)?)
    }
}
