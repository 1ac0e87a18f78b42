//! Confidence-gated routing between the ML estimate and the optimizer
//!
//! The router never trains. Its only link back into the learning loop is
//! [`HybridRouter::record_feedback`], which stores produced schedules in the
//! corpus for the next retraining cycle.

use crate::config::TrainingConfig;
use crate::corpus::{CorpusError, Metadata, ScheduleCorpus};
use crate::models::{FeatureMap, ScheduleRequest};
use crate::observability::{ServiceMetrics, StructuredLogger};
use crate::trainer::{ModelTrainer, Prediction, PredictionMode};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Train count assumed when a request does not state one
pub const DEFAULT_REQUEST_TRAINS: u32 = 25;

/// Source of quality estimates
pub trait QualityPredictor: Send + Sync {
    fn has_model(&self) -> bool;
    fn predict(&self, features: &FeatureMap, use_ensemble: bool) -> Prediction;
}

impl QualityPredictor for ModelTrainer {
    fn has_model(&self) -> bool {
        ModelTrainer::has_model(self)
    }

    fn predict(&self, features: &FeatureMap, use_ensemble: bool) -> Prediction {
        ModelTrainer::predict(self, features, use_ensemble)
    }
}

/// Fallback optimization algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMethod {
    /// Genetic algorithm
    #[default]
    Ga,
    Cmaes,
    /// Particle swarm
    Pso,
    /// Simulated annealing
    Sa,
    Nsga2,
    Adaptive,
    Ensemble,
}

impl OptimizationMethod {
    pub const ALL: [OptimizationMethod; 7] = [
        Self::Ga,
        Self::Cmaes,
        Self::Pso,
        Self::Sa,
        Self::Nsga2,
        Self::Adaptive,
        Self::Ensemble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ga => "ga",
            Self::Cmaes => "cmaes",
            Self::Pso => "pso",
            Self::Sa => "sa",
            Self::Nsga2 => "nsga2",
            Self::Adaptive => "adaptive",
            Self::Ensemble => "ensemble",
        }
    }
}

impl fmt::Display for OptimizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown optimization method '{s}'"))
    }
}

/// Deterministic schedule producer used when the ML estimate is not trusted
#[async_trait]
pub trait ScheduleOptimizer: Send + Sync {
    async fn optimize(
        &self,
        request: &ScheduleRequest,
        method: OptimizationMethod,
    ) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMethod {
    Ml,
    Optimization,
}

impl RoutingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ml => "ml",
            Self::Optimization => "optimization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub use_ml: bool,
    pub method: RoutingMethod,
    pub confidence: f64,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_quality: Option<f64>,
    pub reason: String,
}

/// Routing decision plus what the chosen branch produced
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub decision: RoutingDecision,
    pub features: FeatureMap,
    /// Optimizer output; absent when the ML estimate was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
}

pub struct HybridRouter {
    predictor: Arc<dyn QualityPredictor>,
    corpus: Arc<ScheduleCorpus>,
    use_hybrid: bool,
    use_ensemble: bool,
    threshold: f64,
    metrics: ServiceMetrics,
    logger: StructuredLogger,
}

impl HybridRouter {
    pub fn new(
        predictor: Arc<dyn QualityPredictor>,
        corpus: Arc<ScheduleCorpus>,
        config: &TrainingConfig,
    ) -> Self {
        Self {
            predictor,
            corpus,
            use_hybrid: config.use_hybrid,
            use_ensemble: config.use_ensemble,
            threshold: config.ml_confidence_threshold,
            metrics: ServiceMetrics::new(),
            logger: StructuredLogger::new("router"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Choose between the ML estimate and the optimizer
    pub fn decide(&self, features: &FeatureMap, ml_available: bool) -> RoutingDecision {
        let decision = self.evaluate(features, ml_available);

        self.metrics.record_routing(decision.method.as_str());
        if decision.confidence > 0.0 {
            self.metrics.observe_confidence(decision.confidence);
        }
        self.logger.log_routing_decision(
            decision.method.as_str(),
            decision.confidence,
            decision.threshold,
            &decision.reason,
        );
        decision
    }

    fn evaluate(&self, features: &FeatureMap, ml_available: bool) -> RoutingDecision {
        let fallback = |reason: String, prediction: Option<Prediction>| RoutingDecision {
            use_ml: false,
            method: RoutingMethod::Optimization,
            confidence: prediction.map(|p| p.confidence).unwrap_or(0.0),
            threshold: self.threshold,
            predicted_quality: prediction.map(|p| p.value),
            reason,
        };

        if !self.use_hybrid {
            return fallback("Hybrid mode disabled, using optimization".to_string(), None);
        }
        if !self.predictor.has_model() {
            return fallback("Model unavailable, using optimization".to_string(), None);
        }

        let prediction = self.predictor.predict(features, self.use_ensemble);
        if prediction.mode == PredictionMode::NoModel {
            return fallback("Model unavailable, using optimization".to_string(), None);
        }

        let confidence = prediction.confidence;
        if confidence < self.threshold {
            return fallback(
                format!(
                    "ML confidence {:.2} < threshold {:.2}, using optimization",
                    confidence, self.threshold
                ),
                Some(prediction),
            );
        }
        if !ml_available {
            return fallback(
                format!(
                    "ML confidence {:.2} >= threshold {:.2} but ML is not available, using optimization",
                    confidence, self.threshold
                ),
                Some(prediction),
            );
        }

        RoutingDecision {
            use_ml: true,
            method: RoutingMethod::Ml,
            confidence,
            threshold: self.threshold,
            predicted_quality: Some(prediction.value),
            reason: format!(
                "ML confidence {:.2} >= threshold {:.2}, using ML",
                confidence, self.threshold
            ),
        }
    }

    /// Coarse features available before a schedule exists
    pub fn request_features(request: &ScheduleRequest, now: NaiveDateTime) -> FeatureMap {
        let mut features = FeatureMap::new();
        features.insert(
            "num_trains".into(),
            request.num_trains.unwrap_or(DEFAULT_REQUEST_TRAINS) as f64,
        );
        features.insert("time_of_day".into(), now.hour() as f64);
        features.insert(
            "day_of_week".into(),
            now.weekday().num_days_from_monday() as f64,
        );
        features
    }

    /// Route a request and, on the optimization branch, run the optimizer
    pub async fn recommend(
        &self,
        request: &ScheduleRequest,
        ml_available: bool,
        optimizer: &dyn ScheduleOptimizer,
        method: OptimizationMethod,
        now: NaiveDateTime,
    ) -> anyhow::Result<Recommendation> {
        let features = Self::request_features(request, now);
        let decision = self.decide(&features, ml_available);

        let schedule = match decision.method {
            RoutingMethod::Ml => None,
            RoutingMethod::Optimization => Some(
                optimizer
                    .optimize(request, method)
                    .await
                    .with_context(|| format!("Optimizer '{method}' failed"))?,
            ),
        };

        Ok(Recommendation {
            decision,
            features,
            schedule,
        })
    }

    /// Store a produced schedule for future training
    pub fn record_feedback<S>(
        &self,
        schedule: &S,
        quality_score: Option<f64>,
    ) -> Result<String, CorpusError>
    where
        S: Serialize + ?Sized,
    {
        let mut metadata = Metadata::new();
        metadata.insert("recorded_at".into(), Value::from(Utc::now().to_rfc3339()));
        metadata.insert(
            "quality_score".into(),
            quality_score.map(Value::from).unwrap_or(Value::Null),
        );

        let id = self.corpus.save(schedule, Some(metadata))?;
        self.metrics.inc_feedback_recorded();
        self.logger.log_feedback_recorded(&id, quality_score);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::TempDir;

    struct FixedPredictor {
        model: bool,
        confidence: f64,
    }

    impl QualityPredictor for FixedPredictor {
        fn has_model(&self) -> bool {
            self.model
        }

        fn predict(&self, _features: &FeatureMap, _use_ensemble: bool) -> Prediction {
            Prediction {
                value: 72.5,
                confidence: self.confidence,
                mode: PredictionMode::Ensemble,
            }
        }
    }

    struct EchoOptimizer;

    #[async_trait]
    impl ScheduleOptimizer for EchoOptimizer {
        async fn optimize(
            &self,
            request: &ScheduleRequest,
            method: OptimizationMethod,
        ) -> anyhow::Result<Value> {
            Ok(json!({"method": method.as_str(), "num_trains": request.num_trains}))
        }
    }

    struct FailingOptimizer;

    #[async_trait]
    impl ScheduleOptimizer for FailingOptimizer {
        async fn optimize(&self, _: &ScheduleRequest, _: OptimizationMethod) -> anyhow::Result<Value> {
            anyhow::bail!("solver diverged")
        }
    }

    fn router(dir: &TempDir, model: bool, confidence: f64, config: TrainingConfig) -> HybridRouter {
        let corpus = Arc::new(ScheduleCorpus::new(dir.path()).unwrap());
        let predictor = Arc::new(FixedPredictor { model, confidence });
        HybridRouter::new(predictor, corpus, &config)
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 4)
            .unwrap()
            .and_hms_opt(7, 15, 0)
            .unwrap()
    }

    #[test]
    fn test_low_confidence_falls_back() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir, true, 0.60, TrainingConfig::default());

        let decision = router.decide(&FeatureMap::new(), true);
        assert!(!decision.use_ml);
        assert_eq!(decision.method, RoutingMethod::Optimization);
        assert_eq!(decision.threshold, 0.75);
        assert!(decision.reason.contains("0.60 < threshold 0.75"));
    }

    #[test]
    fn test_confident_prediction_uses_ml() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir, true, 0.9, TrainingConfig::default());

        let decision = router.decide(&FeatureMap::new(), true);
        assert!(decision.use_ml);
        assert_eq!(decision.method, RoutingMethod::Ml);
        assert_eq!(decision.predicted_quality, Some(72.5));
        assert!(decision.reason.contains("0.90 >= threshold 0.75"));
    }

    #[test]
    fn test_ml_unavailable_overrides_confidence() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir, true, 0.9, TrainingConfig::default());

        let decision = router.decide(&FeatureMap::new(), false);
        assert!(!decision.use_ml);
        assert!(decision.reason.contains("not available"));
    }

    #[test]
    fn test_hybrid_disabled_and_missing_model() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            use_hybrid: false,
            ..Default::default()
        };
        let decision = router(&dir, true, 0.99, config).decide(&FeatureMap::new(), true);
        assert_eq!(decision.method, RoutingMethod::Optimization);
        assert!(decision.reason.starts_with("Hybrid mode disabled"));

        let decision = router(&dir, false, 0.99, TrainingConfig::default())
            .decide(&FeatureMap::new(), true);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reason.starts_with("Model unavailable"));
    }

    #[test]
    fn test_request_features() {
        let features = HybridRouter::request_features(&ScheduleRequest::default(), now());
        assert_eq!(features["num_trains"], 25.0);
        assert_eq!(features["time_of_day"], 7.0);
        // 2026-03-04 is a Wednesday
        assert_eq!(features["day_of_week"], 2.0);
    }

    #[tokio::test]
    async fn test_recommend_runs_optimizer_on_fallback() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir, true, 0.5, TrainingConfig::default());
        let request = ScheduleRequest {
            num_trains: Some(18),
            ..Default::default()
        };

        let rec = router
            .recommend(&request, true, &EchoOptimizer, OptimizationMethod::Pso, now())
            .await
            .unwrap();
        assert_eq!(rec.decision.method, RoutingMethod::Optimization);
        assert_eq!(rec.features["num_trains"], 18.0);
        let schedule = rec.schedule.unwrap();
        assert_eq!(schedule["method"], "pso");

        let confident = HybridRouter::new(
            Arc::new(FixedPredictor {
                model: true,
                confidence: 0.95,
            }),
            Arc::new(ScheduleCorpus::new(dir.path()).unwrap()),
            &TrainingConfig::default(),
        );
        let rec = confident
            .recommend(&request, true, &FailingOptimizer, OptimizationMethod::Ga, now())
            .await
            .unwrap();
        assert!(rec.schedule.is_none());
    }

    #[tokio::test]
    async fn test_recommend_propagates_optimizer_failure() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir, false, 0.0, TrainingConfig::default());
        let err = router
            .recommend(
                &ScheduleRequest::default(),
                true,
                &FailingOptimizer,
                OptimizationMethod::Sa,
                now(),
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("solver diverged"));
    }

    #[test]
    fn test_record_feedback_stores_metadata() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir, true, 0.9, TrainingConfig::default());

        let id = router
            .record_feedback(&json!({"schedule_id": "S-1", "trainsets": []}), Some(81.0))
            .unwrap();
        assert!(id.ends_with("S-1"));

        let corpus = ScheduleCorpus::new(dir.path()).unwrap();
        let entries = corpus.load_all(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata["quality_score"], json!(81.0));
        assert!(entries[0].metadata.contains_key("recorded_at"));
    }

    #[test]
    fn test_optimization_method_parsing() {
        assert_eq!("NSGA2".parse::<OptimizationMethod>().unwrap(), OptimizationMethod::Nsga2);
        assert!("tabu".parse::<OptimizationMethod>().is_err());
        assert_eq!(
            serde_json::to_value(OptimizationMethod::Cmaes).unwrap(),
            json!("cmaes")
        );
    }
}
