//! Random forest: bootstrapped trees with per-split feature subsampling

use super::tree::{RegressionTree, TreeOptions};
use super::{validate_training_data, Hyperparameters, ModelError, Regressor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Forest trees grow deeper than boosting stumps
const EXTRA_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    n_trees: usize,
    max_depth: usize,
    seed: u64,
    trees: Vec<RegressionTree>,
}

impl RandomForestRegressor {
    pub const KIND: &'static str = "random_forest";

    pub fn new(params: &Hyperparameters) -> Self {
        Self {
            n_trees: params.epochs.max(1),
            max_depth: params.max_depth + EXTRA_DEPTH,
            seed: params.seed,
            trees: Vec::new(),
        }
    }
}

impl Regressor for RandomForestRegressor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<(), ModelError> {
        let width = validate_training_data(x, y)?;
        let n = y.len();
        let options = TreeOptions {
            max_depth: self.max_depth,
            min_samples_split: 2,
            max_features: Some(width.div_ceil(3).max(1)),
        };
        let mut rng = StdRng::seed_from_u64(self.seed);

        self.trees = (0..self.n_trees)
            .map(|_| {
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x, y, sample, &options, &mut rng)
            })
            .collect();
        Ok(())
    }

    fn predict(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|t| t.predict(row)).sum::<f64>() / self.trees.len() as f64
    }

    fn to_state(&self) -> Result<Value, ModelError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{linear_data, rmse};
    use super::*;

    #[test]
    fn test_forest_fits_reasonably() {
        let (x, y) = linear_data();
        let params = Hyperparameters {
            epochs: 30,
            ..Default::default()
        };
        let mut model = RandomForestRegressor::new(&params);
        model.fit(&x, &y).unwrap();
        assert_eq!(model.trees.len(), 30);

        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let baseline =
            (y.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / y.len() as f64).sqrt();
        assert!(rmse(&model, &x, &y) < baseline * 0.5);
    }

    #[test]
    fn test_forest_seeded() {
        let (x, y) = linear_data();
        let params = Hyperparameters {
            epochs: 10,
            ..Default::default()
        };
        let mut a = RandomForestRegressor::new(&params);
        let mut b = RandomForestRegressor::new(&params);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.predict(&[7.0, 1.0]), b.predict(&[7.0, 1.0]));
    }

    #[test]
    fn test_unfitted_forest_predicts_zero() {
        let model = RandomForestRegressor::new(&Hyperparameters::default());
        assert_eq!(model.predict(&[1.0]), 0.0);
    }
}
