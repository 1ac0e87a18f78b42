//! Trained model set, weighting and prediction

use super::metrics::{std_dev, ValidationMetrics};
use crate::features::FeatureSchema;
use crate::models::FeatureMap;
use crate::regressors::Regressor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ensemble confidence floor
const MIN_ENSEMBLE_CONFIDENCE: f64 = 0.5;

/// Prediction spread (in score points) at which ensemble confidence bottoms out
const SPREAD_SCALE: f64 = 50.0;

/// Single-model confidence base and per-point slope
const BASE_MODEL_CONFIDENCE: f64 = 0.8;
const MODEL_CONFIDENCE_SLOPE: f64 = 0.2;

/// One trained model and its validation scores
pub struct ModelEntry {
    pub name: String,
    pub model: Box<dyn Regressor>,
    pub metrics: ValidationMetrics,
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("name", &self.name)
            .field("kind", &self.model.kind())
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Immutable result of one training run
///
/// Replaced wholesale after every successful run, so readers holding an
/// `Arc` to the previous snapshot keep a consistent view.
#[derive(Debug)]
pub struct EnsembleSnapshot {
    pub models: Vec<ModelEntry>,
    /// Empty when predictions come from the best model alone
    pub weights: BTreeMap<String, f64>,
    pub best_model: String,
    pub last_trained: DateTime<Utc>,
    pub schema: FeatureSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    Ensemble,
    BestModel,
    /// No trained models are available
    NoModel,
}

/// Quality estimate with its confidence in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub value: f64,
    pub confidence: f64,
    pub mode: PredictionMode,
}

impl Prediction {
    pub fn unavailable() -> Self {
        Self {
            value: 0.0,
            confidence: 0.0,
            mode: PredictionMode::NoModel,
        }
    }
}

impl EnsembleSnapshot {
    pub fn model(&self, name: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn best(&self) -> Option<&ModelEntry> {
        self.model(&self.best_model)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    /// Predict the quality score for a feature map
    ///
    /// The weighted ensemble is used when requested and weights exist;
    /// otherwise the best model answers alone.
    pub fn predict(&self, features: &FeatureMap, use_ensemble: bool) -> Prediction {
        let row = self.schema.vectorize(features);

        if use_ensemble && !self.weights.is_empty() {
            let members: Vec<(f64, f64)> = self
                .weights
                .iter()
                .filter_map(|(name, weight)| {
                    self.model(name)
                        .map(|entry| (entry.model.predict(&row), *weight))
                })
                .collect();

            if !members.is_empty() {
                let value: f64 = members.iter().map(|(p, w)| p * w).sum();
                let predictions: Vec<f64> = members.iter().map(|(p, _)| *p).collect();
                return Prediction {
                    value,
                    confidence: ensemble_confidence(&predictions),
                    mode: PredictionMode::Ensemble,
                };
            }
        }

        match self.best() {
            Some(entry) => {
                let value = entry.model.predict(&row);
                Prediction {
                    value,
                    confidence: single_model_confidence(value),
                    mode: PredictionMode::BestModel,
                }
            }
            None => Prediction::unavailable(),
        }
    }
}

/// Agreement-based confidence: identical predictions give 1.0
pub fn ensemble_confidence(predictions: &[f64]) -> f64 {
    let spread = std_dev(predictions);
    if !spread.is_finite() {
        return MIN_ENSEMBLE_CONFIDENCE;
    }
    (1.0 - spread / SPREAD_SCALE).clamp(MIN_ENSEMBLE_CONFIDENCE, 1.0)
}

/// Heuristic confidence for a lone model, rising with the predicted score
pub fn single_model_confidence(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (BASE_MODEL_CONFIDENCE + value / 100.0 * MODEL_CONFIDENCE_SLOPE).clamp(0.0, 1.0)
}

/// Weight the top-N models by validation R²
///
/// Returns an empty map (best-model mode) when ensembling is disabled,
/// fewer than two models trained, or fewer than two candidates score
/// above zero.
pub fn compute_weights(
    models: &[ModelEntry],
    use_ensemble: bool,
    top_n: usize,
) -> BTreeMap<String, f64> {
    if !use_ensemble || models.len() < 2 {
        return BTreeMap::new();
    }

    let mut ranked: Vec<&ModelEntry> = models.iter().collect();
    ranked.sort_by(|a, b| {
        b.metrics
            .score()
            .partial_cmp(&a.metrics.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let candidates: Vec<(&str, f64)> = ranked
        .into_iter()
        .take(top_n)
        .map(|m| (m.name.as_str(), m.metrics.score()))
        .filter(|(_, score)| score.is_finite() && *score > 0.0)
        .collect();

    if candidates.len() < 2 {
        return BTreeMap::new();
    }

    let total: f64 = candidates.iter().map(|(_, s)| s).sum();
    candidates
        .into_iter()
        .map(|(name, score)| (name.to_string(), score / total))
        .collect()
}

/// Highest validation R²; ties go to the earlier model
pub fn select_best(models: &[ModelEntry]) -> Option<&ModelEntry> {
    models.iter().fold(None, |best: Option<&ModelEntry>, entry| match best {
        Some(current) if current.metrics.score() >= entry.metrics.score() => Some(current),
        _ => Some(entry),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressors::ModelError;
    use serde_json::Value;

    /// Model that ignores its input
    struct Constant(f64);

    impl Regressor for Constant {
        fn kind(&self) -> &'static str {
            "constant"
        }
        fn fit(&mut self, _x: &[Vec<f64>], _y: &[f64]) -> Result<(), ModelError> {
            Ok(())
        }
        fn predict(&self, _row: &[f64]) -> f64 {
            self.0
        }
        fn to_state(&self) -> Result<Value, ModelError> {
            Ok(Value::from(self.0))
        }
    }

    fn entry(name: &str, value: f64, r2: f64) -> ModelEntry {
        ModelEntry {
            name: name.to_string(),
            model: Box::new(Constant(value)),
            metrics: ValidationMetrics {
                train_r2: r2,
                validation_r2: r2,
                train_rmse: 1.0,
                validation_rmse: 1.0,
            },
        }
    }

    fn snapshot(models: Vec<ModelEntry>, use_ensemble: bool) -> EnsembleSnapshot {
        let weights = compute_weights(&models, use_ensemble, 3);
        let best_model = select_best(&models).map(|m| m.name.clone()).unwrap_or_default();
        EnsembleSnapshot {
            models,
            weights,
            best_model,
            last_trained: Utc::now(),
            schema: FeatureSchema::new(vec!["num_trains".to_string()]),
        }
    }

    #[test]
    fn test_weights_proportional_to_score() {
        let models = vec![entry("a", 0.0, 0.8), entry("b", 0.0, 0.6), entry("c", 0.0, 0.4)];
        let weights = compute_weights(&models, true, 3);
        assert!((weights["a"] - 0.8 / 1.8).abs() < 1e-12);
        assert!((weights["b"] - 0.6 / 1.8).abs() < 1e-12);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weights_top_n_only() {
        let models = vec![
            entry("a", 0.0, 0.5),
            entry("b", 0.0, 0.9),
            entry("c", 0.0, 0.7),
            entry("d", 0.0, 0.8),
        ];
        let weights = compute_weights(&models, true, 3);
        assert_eq!(weights.len(), 3);
        assert!(!weights.contains_key("a"));
    }

    #[test]
    fn test_weights_empty_cases() {
        assert!(compute_weights(&[entry("a", 0.0, 0.9)], true, 3).is_empty());
        let two = vec![entry("a", 0.0, 0.9), entry("b", 0.0, 0.8)];
        assert!(compute_weights(&two, false, 3).is_empty());
        let negative = vec![entry("a", 0.0, -0.2), entry("b", 0.0, -0.1)];
        assert!(compute_weights(&negative, true, 3).is_empty());
    }

    #[test]
    fn test_select_best_prefers_first_on_tie() {
        let models = vec![entry("a", 0.0, 0.7), entry("b", 0.0, 0.9), entry("c", 0.0, 0.9)];
        assert_eq!(select_best(&models).unwrap().name, "b");
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn test_ensemble_prediction_agreeing_models() {
        let snap = snapshot(vec![entry("a", 70.0, 0.8), entry("b", 70.0, 0.6)], true);
        let p = snap.predict(&FeatureMap::new(), true);
        assert_eq!(p.mode, PredictionMode::Ensemble);
        assert!((p.value - 70.0).abs() < 1e-9);
        assert!((p.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ensemble_confidence_floor() {
        assert_eq!(ensemble_confidence(&[0.0, 200.0]), 0.5);
        // std of [60, 80] is 10
        assert!((ensemble_confidence(&[60.0, 80.0]) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_best_model_prediction() {
        let snap = snapshot(vec![entry("a", 50.0, 0.8), entry("b", 90.0, 0.6)], false);
        let p = snap.predict(&FeatureMap::new(), true);
        assert_eq!(p.mode, PredictionMode::BestModel);
        assert_eq!(p.value, 50.0);
        assert!((p.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_single_model_confidence_clamped() {
        assert_eq!(single_model_confidence(150.0), 1.0);
        assert_eq!(single_model_confidence(-500.0), 0.0);
        assert_eq!(single_model_confidence(f64::NAN), 0.0);
    }
}
