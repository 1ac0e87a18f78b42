//! Regression evaluation metrics

use serde::{Deserialize, Serialize};

/// Scores of one model on its train and validation split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub train_r2: f64,
    pub validation_r2: f64,
    pub train_rmse: f64,
    pub validation_rmse: f64,
}

impl ValidationMetrics {
    /// Score used for model ranking and ensemble weighting
    pub fn score(&self) -> f64 {
        self.validation_r2
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Coefficient of determination
///
/// A constant target scores 1.0 when predicted exactly and 0.0 otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return 0.0;
    }
    let m = mean(y_true);
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - m).powi(2)).sum();
    if ss_tot.abs() < f64::EPSILON {
        return if ss_res.abs() < f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return 0.0;
    }
    let mse = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / y_true.len() as f64;
    mse.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r2_perfect_and_mean() {
        let y = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(r2_score(&y, &y), 1.0);
        assert!(r2_score(&y, &[2.5, 2.5, 2.5, 2.5]).abs() < 1e-12);
        assert!(r2_score(&y, &[4.0, 3.0, 2.0, 1.0]) < 0.0);
    }

    #[test]
    fn test_r2_constant_target() {
        assert_eq!(r2_score(&[3.0, 3.0], &[3.0, 3.0]), 1.0);
        assert_eq!(r2_score(&[3.0, 3.0], &[3.0, 4.0]), 0.0);
    }

    #[test]
    fn test_rmse() {
        assert!((rmse(&[0.0, 0.0], &[3.0, 4.0]) - 12.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(rmse(&[], &[]), 0.0);
    }

    #[test]
    fn test_std_dev() {
        let values = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&values) - 2.0).abs() < 1e-12);
        assert_eq!(std_dev(&[]), 0.0);
    }
}
