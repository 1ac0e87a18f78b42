//! Training and routing configuration
//!
//! Every option has a default so the service starts without any
//! configuration source. The binary layers a config file and environment
//! variables on top of these defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default retrain interval (48 hours)
pub const DEFAULT_RETRAIN_INTERVAL_HOURS: u64 = 48;

/// Default scheduler check interval (1 hour)
pub const DEFAULT_CHECK_INTERVAL_MINUTES: u64 = 60;

/// Upper bound on the scheduler check interval (one year)
pub const MAX_CHECK_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

/// Features used when no list is configured, in model input order
pub const DEFAULT_FEATURES: &[&str] = &[
    "num_trains",
    "num_available",
    "avg_readiness_score",
    "total_mileage",
    "mileage_variance",
    "maintenance_count",
    "certificate_expiry_count",
    "branding_priority_sum",
    "time_of_day",
    "day_of_week",
];

/// Model variants trained when no list is configured
pub const DEFAULT_MODEL_TYPES: &[&str] = &["gradient_boosting", "random_forest", "ridge", "knn"];

/// Configuration for training, prediction and routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Minimum hours between automatic retrains
    pub retrain_interval_hours: u64,
    /// Schedules required before the first model is trained
    pub min_schedules_for_training: usize,
    /// New schedules required since the last run to permit a retrain
    pub min_schedules_for_retrain: usize,
    /// Model variants to train, by registry name
    pub model_types: Vec<String>,
    /// Blend models by validation score instead of using the best one
    pub use_ensemble: bool,
    /// Number of best-scoring models that receive ensemble weight
    pub ensemble_top_n: usize,
    /// Fraction of rows held out for validation
    pub validation_split: f64,
    /// Boosting rounds / forest size
    pub epochs: usize,
    /// Shrinkage applied per boosting round
    pub learning_rate: f64,
    /// Maximum depth of tree-based models
    pub max_depth: usize,
    /// Seed for the train/validation split and bootstrap sampling
    pub seed: u64,
    /// Ordered feature list; part of every trained model's identity
    pub features: Vec<String>,
    /// Name of the predicted quality target
    pub target: String,
    /// Allow routing requests to the ML estimate
    pub use_hybrid: bool,
    /// Minimum confidence for the ML estimate to be trusted
    pub ml_confidence_threshold: f64,
    /// Directory holding persisted schedules
    pub data_dir: PathBuf,
    /// Directory holding model blobs and training history
    pub model_dir: PathBuf,
    /// Timestamped model archives kept besides the latest blob
    pub archives_to_keep: usize,
    /// How often the background loop evaluates the retrain trigger
    pub check_interval_minutes: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            retrain_interval_hours: DEFAULT_RETRAIN_INTERVAL_HOURS,
            min_schedules_for_training: 100,
            min_schedules_for_retrain: 50,
            model_types: DEFAULT_MODEL_TYPES.iter().map(|s| s.to_string()).collect(),
            use_ensemble: true,
            ensemble_top_n: 3,
            validation_split: 0.2,
            epochs: 100,
            learning_rate: 0.1,
            max_depth: 3,
            seed: 42,
            features: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
            target: "schedule_quality_score".to_string(),
            use_hybrid: true,
            ml_confidence_threshold: 0.75,
            data_dir: PathBuf::from("data/schedules"),
            model_dir: PathBuf::from("models"),
            archives_to_keep: 10,
            check_interval_minutes: DEFAULT_CHECK_INTERVAL_MINUTES,
        }
    }
}

impl TrainingConfig {
    /// Minimum time between automatic retrains
    ///
    /// Saturates at the largest representable duration, so an oversized
    /// setting disables time-based retraining instead of wrapping around.
    pub fn retrain_interval(&self) -> chrono::Duration {
        i64::try_from(self.retrain_interval_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Background loop tick period, between one minute and one year
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(
            self.check_interval_minutes
                .clamp(1, MAX_CHECK_INTERVAL_MINUTES)
                * 60,
        )
    }
}
