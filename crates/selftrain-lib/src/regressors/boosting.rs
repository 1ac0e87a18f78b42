//! Gradient-boosted regression trees (squared loss)

use super::tree::{RegressionTree, TreeOptions};
use super::{validate_training_data, Hyperparameters, ModelError, Regressor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostingRegressor {
    rounds: usize,
    learning_rate: f64,
    max_depth: usize,
    seed: u64,
    init: f64,
    trees: Vec<RegressionTree>,
}

impl GradientBoostingRegressor {
    pub const KIND: &'static str = "gradient_boosting";

    pub fn new(params: &Hyperparameters) -> Self {
        Self {
            rounds: params.epochs.max(1),
            learning_rate: params.learning_rate,
            max_depth: params.max_depth.max(1),
            seed: params.seed,
            init: 0.0,
            trees: Vec::new(),
        }
    }
}

impl Regressor for GradientBoostingRegressor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<(), ModelError> {
        validate_training_data(x, y)?;
        let n = y.len();
        let options = TreeOptions {
            max_depth: self.max_depth,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(self.seed);

        self.init = y.iter().sum::<f64>() / n as f64;
        self.trees = Vec::with_capacity(self.rounds);
        let mut raw = vec![self.init; n];

        for _round in 0..self.rounds {
            let residuals: Vec<f64> = y.iter().zip(&raw).map(|(t, p)| t - p).collect();
            let tree = RegressionTree::fit(x, &residuals, (0..n).collect(), &options, &mut rng);
            for (i, row) in x.iter().enumerate() {
                raw[i] += self.learning_rate * tree.predict(row);
            }
            self.trees.push(tree);
        }
        Ok(())
    }

    fn predict(&self, row: &[f64]) -> f64 {
        self.init
            + self
                .trees
                .iter()
                .map(|t| self.learning_rate * t.predict(row))
                .sum::<f64>()
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
    fn test_boosting_reduces_error() {
        let (x, y) = linear_data();
        let params = Hyperparameters::default();
        let mut model = GradientBoostingRegressor::new(&params);
        model.fit(&x, &y).unwrap();

        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let baseline =
            (y.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / y.len() as f64).sqrt();
        assert!(rmse(&model, &x, &y) < baseline * 0.2);
    }

    #[test]
    fn test_boosting_deterministic() {
        let (x, y) = linear_data();
        let params = Hyperparameters::default();
        let mut a = GradientBoostingRegressor::new(&params);
        let mut b = GradientBoostingRegressor::new(&params);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.predict(&[4.0, 2.0]), b.predict(&[4.0, 2.0]));
    }

    #[test]
    fn test_boosting_rejects_empty() {
        let mut model = GradientBoostingRegressor::new(&Hyperparameters::default());
        assert!(model.fit(&[], &[]).is_err());
    }
}
