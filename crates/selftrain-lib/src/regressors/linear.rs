//! Ridge regression on standardized features, solved in closed form

use super::{validate_training_data, Hyperparameters, ModelError, Regressor, Standardizer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_ALPHA: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeRegressor {
    alpha: f64,
    scaler: Standardizer,
    weights: Vec<f64>,
    intercept: f64,
}

impl RidgeRegressor {
    pub const KIND: &'static str = "ridge";

    pub fn new(_params: &Hyperparameters) -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            scaler: Standardizer::default(),
            weights: Vec::new(),
            intercept: 0.0,
        }
    }
}

impl Regressor for RidgeRegressor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<(), ModelError> {
        let width = validate_training_data(x, y)?;
        let scaler = Standardizer::fit(x, width);
        let z: Vec<Vec<f64>> = x.iter().map(|row| scaler.transform(row)).collect();
        let y_mean = y.iter().sum::<f64>() / y.len() as f64;

        // (ZᵀZ + αI) w = Zᵀ(y - ȳ)
        let mut a = vec![vec![0.0; width]; width];
        let mut b = vec![0.0; width];
        for (row, target) in z.iter().zip(y) {
            let centered = target - y_mean;
            for i in 0..width {
                b[i] += row[i] * centered;
                for j in 0..width {
                    a[i][j] += row[i] * row[j];
                }
            }
        }
        for (i, diag) in a.iter_mut().enumerate() {
            diag[i] += self.alpha;
        }

        self.weights = solve(a, b)?;
        self.intercept = y_mean;
        self.scaler = scaler;
        Ok(())
    }

    fn predict(&self, row: &[f64]) -> f64 {
        let z = self.scaler.transform(row);
        self.intercept + z.iter().zip(&self.weights).map(|(v, w)| v * w).sum::<f64>()
    }

    fn to_state(&self) -> Result<Value, ModelError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ModelError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                a[i][col]
                    .abs()
                    .partial_cmp(&a[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or(ModelError::Singular)?;
        if a[pivot][col].abs() < 1e-12 {
            return Err(ModelError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{linear_data, rmse};
    use super::*;

    #[test]
    fn test_ridge_recovers_linear_signal() {
        let (x, y) = linear_data();
        let mut model = RidgeRegressor::new(&Hyperparameters::default());
        model.fit(&x, &y).unwrap();
        // Light shrinkage only
        assert!(rmse(&model, &x, &y) < 0.5);
        assert!((model.predict(&[5.0, 2.0]) - 21.0).abs() < 0.5);
    }

    #[test]
    fn test_solve_small_system() {
        let a = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let b = vec![3.0, 5.0];
        let x = solve(a, b).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-9);
        assert!((x[1] - 1.4).abs() < 1e-9);
    }

    #[test]
    fn test_solve_singular() {
        let a = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(matches!(solve(a, vec![1.0, 2.0]), Err(ModelError::Singular)));
    }
}
