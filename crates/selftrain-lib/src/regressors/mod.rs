//! Interchangeable regression models
//!
//! Every model variant implements [`Regressor`] and is reachable through a
//! named [`ModelFactory`] in the [`ModelRegistry`]. Adding a variant means
//! registering a factory; the trainer never branches on model names.

mod boosting;
mod forest;
mod knn;
mod linear;
mod tree;

pub use boosting::GradientBoostingRegressor;
pub use forest::RandomForestRegressor;
pub use knn::KnnRegressor;
pub use linear::RidgeRegressor;
pub use tree::{RegressionTree, TreeOptions};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot fit on an empty dataset")]
    EmptyDataset,
    #[error("row {row} has {found} features, expected {expected}")]
    ShapeMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("{x_rows} feature rows but {y_rows} targets")]
    LengthMismatch { x_rows: usize, y_rows: usize },
    #[error("training data contains non-finite values")]
    NonFinite,
    #[error("linear system is singular")]
    Singular,
    #[error("model state could not be (de)serialized: {0}")]
    State(#[from] serde_json::Error),
    #[error("no model registered under '{0}'")]
    Unregistered(String),
}

/// Hyperparameters shared by all factories; each model uses what applies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.1,
            max_depth: 3,
            seed: 42,
        }
    }
}

/// Common capability of every model variant
pub trait Regressor: Send + Sync {
    /// Registry kind this model was built from
    fn kind(&self) -> &'static str;

    /// Fit on a row-major feature matrix
    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<(), ModelError>;

    /// Point estimate for a single feature row
    fn predict(&self, row: &[f64]) -> f64;

    /// Serializable trained state, restorable through the registry
    fn to_state(&self) -> Result<Value, ModelError>;
}

type BuildFn = Box<dyn Fn(&Hyperparameters) -> Box<dyn Regressor> + Send + Sync>;
type RestoreFn = Box<dyn Fn(Value) -> Result<Box<dyn Regressor>, ModelError> + Send + Sync>;

/// Constructor pair for one model variant
pub struct ModelFactory {
    build: BuildFn,
    restore: RestoreFn,
}

impl ModelFactory {
    pub fn new<B, R>(build: B, restore: R) -> Self
    where
        B: Fn(&Hyperparameters) -> Box<dyn Regressor> + Send + Sync + 'static,
        R: Fn(Value) -> Result<Box<dyn Regressor>, ModelError> + Send + Sync + 'static,
    {
        Self {
            build: Box::new(build),
            restore: Box::new(restore),
        }
    }

    /// Factory for a serde-persisted model type
    pub fn serde<M, B>(build: B) -> Self
    where
        M: Regressor + serde::de::DeserializeOwned + 'static,
        B: Fn(&Hyperparameters) -> M + Send + Sync + 'static,
    {
        Self::new(
            move |params: &Hyperparameters| -> Box<dyn Regressor> { Box::new(build(params)) },
            |state: Value| {
                let model: M = serde_json::from_value(state)?;
                Ok(Box::new(model) as Box<dyn Regressor>)
            },
        )
    }
}

/// Named model factories
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in variant
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            GradientBoostingRegressor::KIND,
            ModelFactory::serde(GradientBoostingRegressor::new),
        );
        registry.register(
            RandomForestRegressor::KIND,
            ModelFactory::serde(RandomForestRegressor::new),
        );
        registry.register(RidgeRegressor::KIND, ModelFactory::serde(RidgeRegressor::new));
        registry.register(KnnRegressor::KIND, ModelFactory::serde(KnnRegressor::new));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ModelFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Fresh, untrained model; `None` if the name is not registered
    pub fn build(&self, name: &str, params: &Hyperparameters) -> Option<Box<dyn Regressor>> {
        self.factories.get(name).map(|f| (f.build)(params))
    }

    /// Rebuild a trained model from persisted state
    pub fn restore(&self, name: &str, state: Value) -> Result<Box<dyn Regressor>, ModelError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ModelError::Unregistered(name.to_string()))?;
        (factory.restore)(state)
    }
}

/// Reject empty, ragged or non-finite training data
pub(crate) fn validate_training_data(x: &[Vec<f64>], y: &[f64]) -> Result<usize, ModelError> {
    if x.is_empty() {
        return Err(ModelError::EmptyDataset);
    }
    if x.len() != y.len() {
        return Err(ModelError::LengthMismatch {
            x_rows: x.len(),
            y_rows: y.len(),
        });
    }
    let width = x[0].len();
    for (row, values) in x.iter().enumerate() {
        if values.len() != width {
            return Err(ModelError::ShapeMismatch {
                row,
                expected: width,
                found: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite);
        }
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::NonFinite);
    }
    Ok(width)
}

/// Per-feature z-score scaling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Standardizer {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl Standardizer {
    pub(crate) fn fit(x: &[Vec<f64>], width: usize) -> Self {
        let n = x.len().max(1) as f64;
        let mut means = vec![0.0; width];
        for row in x {
            for (j, v) in row.iter().enumerate() {
                means[j] += v / n;
            }
        }
        let mut scales = vec![0.0; width];
        for row in x {
            for (j, v) in row.iter().enumerate() {
                scales[j] += (v - means[j]).powi(2) / n;
            }
        }
        for s in &mut scales {
            *s = s.sqrt();
            if *s < 1e-12 {
                *s = 1.0;
            }
        }
        Self { means, scales }
    }

    pub(crate) fn transform(&self, row: &[f64]) -> Vec<f64> {
        self.means
            .iter()
            .zip(&self.scales)
            .enumerate()
            .map(|(j, (m, s))| (row.get(j).copied().unwrap_or(0.0) - m) / s)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Noise-free target `3a - 2b + 10` on a small grid
    pub fn linear_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for a in 0..10 {
            for b in 0..6 {
                let (a, b) = (a as f64, b as f64);
                x.push(vec![a, b]);
                y.push(3.0 * a - 2.0 * b + 10.0);
            }
        }
        (x, y)
    }

    pub fn rmse(model: &dyn super::Regressor, x: &[Vec<f64>], y: &[f64]) -> f64 {
        let sse: f64 = x
            .iter()
            .zip(y)
            .map(|(row, t)| (model.predict(row) - t).powi(2))
            .sum();
        (sse / y.len() as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::linear_data;
    use super::*;

    #[test]
    fn test_default_registry_names() {
        let registry = ModelRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec!["gradient_boosting", "knn", "random_forest", "ridge"]
        );
        assert!(registry.build("xgboost", &Hyperparameters::default()).is_none());
    }

    #[test]
    fn test_restore_roundtrip_through_registry() {
        let registry = ModelRegistry::with_defaults();
        let (x, y) = linear_data();
        for name in registry.names() {
            let mut model = registry.build(&name, &Hyperparameters::default()).unwrap();
            model.fit(&x, &y).unwrap();
            let restored = registry.restore(&name, model.to_state().unwrap()).unwrap();
            assert_eq!(restored.kind(), model.kind());
            for row in x.iter().take(5) {
                assert!((restored.predict(row) - model.predict(row)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_restore_unregistered() {
        let registry = ModelRegistry::empty();
        assert!(matches!(
            registry.restore("ridge", Value::Null),
            Err(ModelError::Unregistered(_))
        ));
    }

    #[test]
    fn test_validate_training_data() {
        assert!(matches!(
            validate_training_data(&[], &[]),
            Err(ModelError::EmptyDataset)
        ));
        assert!(matches!(
            validate_training_data(&[vec![1.0], vec![1.0, 2.0]], &[1.0, 2.0]),
            Err(ModelError::ShapeMismatch { row: 1, .. })
        ));
        assert!(matches!(
            validate_training_data(&[vec![f64::NAN]], &[1.0]),
            Err(ModelError::NonFinite)
        ));
        assert_eq!(validate_training_data(&[vec![1.0, 2.0]], &[3.0]).unwrap(), 2);
    }

    #[test]
    fn test_standardizer_constant_column() {
        let x = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let s = Standardizer::fit(&x, 2);
        let t = s.transform(&[3.0, 5.0]);
        assert!((t[0] - 1.0).abs() < 1e-9);
        assert_eq!(t[1], 0.0);
    }
}
