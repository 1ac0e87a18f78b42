//! Self-training library for schedule quality prediction
//!
//! This crate provides the core functionality for:
//! - Persisting produced schedules as training corpus
//! - Feature and quality-target extraction
//! - Ensemble training, persistence and confidence-scored prediction
//! - Confidence-gated routing between ML and the fallback optimizer
//! - Background retraining
//! - Health checks and observability

pub mod config;
pub mod corpus;
pub mod features;
pub mod health;
pub mod models;
pub mod observability;
pub mod regressors;
pub mod router;
pub mod scheduler;
pub mod trainer;

pub use config::TrainingConfig;
pub use corpus::{CorpusEntry, CorpusError, Metadata, RetainReport, ScheduleCorpus};
pub use features::{compute_target, extract, Dataset, FeatureExtractor, FeatureSchema};
pub use health::{
    components, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{ServiceMetrics, StructuredLogger};
pub use regressors::{Hyperparameters, ModelError, ModelFactory, ModelRegistry, Regressor};
pub use router::{
    HybridRouter, OptimizationMethod, QualityPredictor, Recommendation, RoutingDecision,
    RoutingMethod, ScheduleOptimizer,
};
pub use scheduler::{RetrainingService, ServiceStatus};
pub use trainer::{
    EnsembleSnapshot, ModelInfo, ModelStore, ModelTrainer, PersistenceError, Prediction,
    PredictionMode, RetrainDecision, TrainOutcome, TrainerPhase, TrainingError, TrainingReport,
    TrainingRunRecord, ValidationMetrics,
};
