//! Ensemble training over the schedule corpus
//!
//! A training run loads every stored schedule, fits each configured model
//! variant on a seeded train/validation split, weights the best scorers and
//! persists the result. The active [`EnsembleSnapshot`] is swapped atomically
//! so predictions never observe a half-trained model set.

mod ensemble;
mod metrics;
mod persistence;

pub use ensemble::{
    compute_weights, ensemble_confidence, select_best, single_model_confidence, EnsembleSnapshot,
    ModelEntry, Prediction, PredictionMode,
};
pub use metrics::{mean, r2_score, rmse, std_dev, ValidationMetrics};
pub use persistence::{ModelStore, PersistenceError, SavedBlob, FORMAT_VERSION};

use crate::config::TrainingConfig;
use crate::corpus::{CorpusError, ScheduleCorpus};
use crate::features::{Dataset, FeatureExtractor, FeatureSchema};
use crate::models::FeatureMap;
use crate::observability::ServiceMetrics;
use crate::regressors::{Hyperparameters, ModelRegistry};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("corpus error: {0}")]
    Corpus(#[from] CorpusError),
    #[error("no usable schedule records ({skipped} could not be decoded)")]
    NoUsableRecords { skipped: usize },
    #[error("no model variant could be trained: {}", failures.join("; "))]
    AllModelsFailed { failures: Vec<String> },
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("training task did not complete: {0}")]
    Interrupted(String),
}

/// Where the trainer currently is in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerPhase {
    Idle,
    CheckingTrigger,
    Training,
    Persisting,
}

/// Result of a completed training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub trained_at: DateTime<Utc>,
    pub models_trained: Vec<String>,
    /// Model name to the reason it was not trained
    pub skipped_models: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, ValidationMetrics>,
    pub best_model: String,
    pub ensemble_weights: BTreeMap<String, f64>,
    pub train_samples: usize,
    pub validation_samples: usize,
    /// Corpus records that could not be decoded
    pub records_skipped: usize,
    pub duration_secs: f64,
    pub blob_checksum: String,
}

impl TrainingReport {
    pub fn samples_used(&self) -> usize {
        self.train_samples + self.validation_samples
    }

    pub fn best_metrics(&self) -> Option<&ValidationMetrics> {
        self.metrics.get(&self.best_model)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainOutcome {
    Trained(TrainingReport),
    NotNeeded { reason: String },
    InsufficientData { required: usize, available: usize },
}

impl TrainOutcome {
    /// Label used in metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Trained(_) => "trained",
            Self::NotNeeded { .. } => "not_needed",
            Self::InsufficientData { .. } => "insufficient_data",
        }
    }
}

/// One entry of the persisted training history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRunRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub feature_identity: String,
    pub metrics: BTreeMap<String, ValidationMetrics>,
    pub best_model: String,
    #[serde(default)]
    pub ensemble_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub samples_used: usize,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub blob_checksum: String,
}

/// Whether an automatic retrain is due, and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainDecision {
    pub due: bool,
    pub reason: String,
}

/// Read-only summary of the trainer state
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub models_loaded: Vec<String>,
    pub best_model: Option<String>,
    pub best_model_metrics: Option<ValidationMetrics>,
    pub ensemble_enabled: bool,
    pub ensemble_weights: BTreeMap<String, f64>,
    pub last_trained: Option<DateTime<Utc>>,
    pub should_retrain: bool,
    pub schedules_available: usize,
    pub training_runs: usize,
    pub phase: TrainerPhase,
    pub features: Vec<String>,
    pub feature_identity: String,
}

/// Trains, persists and serves the schedule quality ensemble
pub struct ModelTrainer {
    config: TrainingConfig,
    corpus: Arc<ScheduleCorpus>,
    registry: ModelRegistry,
    extractor: FeatureExtractor,
    store: ModelStore,
    snapshot: RwLock<Option<Arc<EnsembleSnapshot>>>,
    /// Set when the persisted blob could not be used; cleared on install
    load_failed: AtomicBool,
    history: RwLock<Vec<TrainingRunRecord>>,
    phase: RwLock<TrainerPhase>,
    training: Mutex<()>,
    metrics: ServiceMetrics,
}

impl ModelTrainer {
    /// Trainer with the built-in model variants
    pub fn new(config: TrainingConfig, corpus: Arc<ScheduleCorpus>) -> Result<Self, TrainingError> {
        Self::with_registry(config, corpus, ModelRegistry::with_defaults())
    }

    /// Trainer over a custom model registry
    ///
    /// Previously persisted models and history are loaded eagerly; a missing
    /// or unusable blob leaves the trainer without models.
    pub fn with_registry(
        config: TrainingConfig,
        corpus: Arc<ScheduleCorpus>,
        registry: ModelRegistry,
    ) -> Result<Self, TrainingError> {
        let store = ModelStore::new(&config.model_dir, config.archives_to_keep)?;
        let history = store.load_history().unwrap_or_else(|e| {
            warn!(error = %e, "Training history unreadable, starting empty");
            Vec::new()
        });
        let extractor = FeatureExtractor::new(FeatureSchema::new(config.features.clone()));

        for name in &config.model_types {
            if !registry.contains(name) {
                warn!(model = %name, "Configured model type is not registered and will be skipped");
            }
        }

        let trainer = Self {
            config,
            corpus,
            registry,
            extractor,
            store,
            snapshot: RwLock::new(None),
            load_failed: AtomicBool::new(false),
            history: RwLock::new(history),
            phase: RwLock::new(TrainerPhase::Idle),
            training: Mutex::new(()),
            metrics: ServiceMetrics::new(),
        };
        trainer.load();
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn corpus(&self) -> &Arc<ScheduleCorpus> {
        &self.corpus
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.extractor.schema()
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn phase(&self) -> TrainerPhase {
        *self.phase.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: TrainerPhase) {
        *self.phase.write().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// Active snapshot, if any
    pub fn snapshot(&self) -> Option<Arc<EnsembleSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, snapshot: Arc<EnsembleSnapshot>) {
        let best_r2 = snapshot.best().map(|m| m.metrics.score()).unwrap_or(0.0);
        self.metrics
            .set_active_models(snapshot.models.len(), Some(snapshot.best_model.as_str()), best_r2);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        self.load_failed.store(false, Ordering::Release);
    }

    pub fn last_trained(&self) -> Option<DateTime<Utc>> {
        self.snapshot().map(|s| s.last_trained)
    }

    /// True if a snapshot is active or can be loaded from disk
    pub fn has_model(&self) -> bool {
        self.current_or_load().is_some()
    }

    /// Load the latest persisted snapshot; returns whether one was installed
    ///
    /// An unusable blob is not retried by `predict` or `has_model` until a
    /// training run or another explicit `load` succeeds.
    pub fn load(&self) -> bool {
        match self.store.load_latest(&self.registry, self.extractor.schema()) {
            Ok(snapshot) => {
                info!(
                    models = snapshot.models.len(),
                    best_model = %snapshot.best_model,
                    last_trained = %snapshot.last_trained,
                    "Loaded persisted models"
                );
                self.install(Arc::new(snapshot));
                true
            }
            Err(PersistenceError::Missing(path)) => {
                debug!(path = %path.display(), "No persisted models yet");
                false
            }
            Err(e) => {
                warn!(error = %e, "Persisted models unavailable until the next training run");
                self.load_failed.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Active snapshot, lazily loading one unless a previous load was rejected
    fn current_or_load(&self) -> Option<Arc<EnsembleSnapshot>> {
        if let Some(snapshot) = self.snapshot() {
            return Some(snapshot);
        }
        if self.load_failed.load(Ordering::Acquire) {
            return None;
        }
        self.load();
        self.snapshot()
    }

    /// Evaluate the automatic retrain trigger
    pub fn retrain_decision(&self) -> RetrainDecision {
        let last = match self.last_trained() {
            Some(last) => last,
            None => {
                return RetrainDecision {
                    due: true,
                    reason: "no model has been trained yet".to_string(),
                }
            }
        };

        let elapsed = Utc::now() - last;
        let interval = self.config.retrain_interval();
        if elapsed < interval {
            return RetrainDecision {
                due: false,
                reason: format!(
                    "last trained {:.1}h ago, interval is {}h",
                    elapsed.num_seconds() as f64 / 3600.0,
                    self.config.retrain_interval_hours
                ),
            };
        }

        let new_schedules = match self.corpus.count_since(last) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count new schedules");
                return RetrainDecision {
                    due: false,
                    reason: format!("could not count new schedules: {e}"),
                };
            }
        };
        let required = self.config.min_schedules_for_retrain;
        RetrainDecision {
            due: new_schedules >= required,
            reason: format!("{new_schedules} new schedules since last training, {required} required"),
        }
    }

    pub fn should_retrain(&self) -> bool {
        self.retrain_decision().due
    }

    /// Run a training cycle
    ///
    /// Concurrent calls are serialized. Without `force` the run only proceeds
    /// if [`ModelTrainer::should_retrain`] holds.
    pub fn train(&self, force: bool) -> Result<TrainOutcome, TrainingError> {
        let _guard = self.training.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.run_locked(force);
        self.set_phase(TrainerPhase::Idle);

        match &result {
            Ok(TrainOutcome::Trained(report)) => self
                .metrics
                .record_training("trained", Some(report.duration_secs)),
            Ok(outcome) => self.metrics.record_training(outcome.label(), None),
            Err(_) => self.metrics.record_training("failed", None),
        }
        result
    }

    fn run_locked(&self, force: bool) -> Result<TrainOutcome, TrainingError> {
        let started = Instant::now();
        self.set_phase(TrainerPhase::CheckingTrigger);

        if !force {
            let decision = self.retrain_decision();
            if !decision.due {
                debug!(reason = %decision.reason, "Retraining not needed");
                return Ok(TrainOutcome::NotNeeded {
                    reason: decision.reason,
                });
            }
        }

        let available = self.corpus.count_all()?;
        self.metrics.set_corpus_size(available);
        let required = self.config.min_schedules_for_training;
        if available < required {
            info!(available, required, "Not enough schedules for training");
            return Ok(TrainOutcome::InsufficientData {
                required,
                available,
            });
        }

        self.set_phase(TrainerPhase::Training);
        let entries = self.corpus.load_all(None)?;
        let dataset = self
            .extractor
            .prepare_dataset(entries.iter().map(|entry| &entry.schedule));
        if dataset.is_empty() {
            return Err(TrainingError::NoUsableRecords {
                skipped: dataset.skipped,
            });
        }

        let (train_idx, val_idx) =
            split_indices(dataset.len(), self.config.validation_split, self.config.seed);
        let (train_x, train_y) = select_rows(&dataset, &train_idx);
        let (val_x, val_y) = select_rows(&dataset, &val_idx);
        info!(
            train_samples = train_x.len(),
            validation_samples = val_x.len(),
            skipped = dataset.skipped,
            "Training models"
        );

        let params = Hyperparameters {
            epochs: self.config.epochs,
            learning_rate: self.config.learning_rate,
            max_depth: self.config.max_depth,
            seed: self.config.seed,
        };

        let mut models: Vec<ModelEntry> = Vec::new();
        let mut skipped_models = BTreeMap::new();
        for name in &self.config.model_types {
            if models.iter().any(|m| &m.name == name) || skipped_models.contains_key(name) {
                continue;
            }
            let Some(mut model) = self.registry.build(name, &params) else {
                warn!(model = %name, "Unknown model type, skipping");
                skipped_models.insert(name.clone(), "not registered".to_string());
                continue;
            };
            if let Err(e) = model.fit(&train_x, &train_y) {
                warn!(model = %name, error = %e, "Model training failed");
                skipped_models.insert(name.clone(), e.to_string());
                continue;
            }

            let train_pred: Vec<f64> = train_x.iter().map(|row| model.predict(row)).collect();
            let val_pred: Vec<f64> = val_x.iter().map(|row| model.predict(row)).collect();
            let scores = ValidationMetrics {
                train_r2: r2_score(&train_y, &train_pred),
                validation_r2: r2_score(&val_y, &val_pred),
                train_rmse: rmse(&train_y, &train_pred),
                validation_rmse: rmse(&val_y, &val_pred),
            };
            if !(scores.validation_r2.is_finite() && scores.validation_rmse.is_finite()) {
                warn!(model = %name, "Model produced non-finite predictions, skipping");
                skipped_models.insert(name.clone(), "non-finite predictions".to_string());
                continue;
            }

            info!(
                model = %name,
                train_r2 = scores.train_r2,
                validation_r2 = scores.validation_r2,
                validation_rmse = scores.validation_rmse,
                "Model trained"
            );
            models.push(ModelEntry {
                name: name.clone(),
                model,
                metrics: scores,
            });
        }

        let best_model = match select_best(&models) {
            Some(best) => best.name.clone(),
            None => {
                return Err(TrainingError::AllModelsFailed {
                    failures: skipped_models
                        .iter()
                        .map(|(name, reason)| format!("{name}: {reason}"))
                        .collect(),
                })
            }
        };
        let weights = compute_weights(&models, self.config.use_ensemble, self.config.ensemble_top_n);

        let trained_at = Utc::now();
        let metrics: BTreeMap<String, ValidationMetrics> = models
            .iter()
            .map(|m| (m.name.clone(), m.metrics))
            .collect();
        let models_trained: Vec<String> = models.iter().map(|m| m.name.clone()).collect();
        let snapshot = EnsembleSnapshot {
            models,
            weights: weights.clone(),
            best_model: best_model.clone(),
            last_trained: trained_at,
            schema: self.extractor.schema().clone(),
        };

        self.set_phase(TrainerPhase::Persisting);
        let saved = self.store.save(&snapshot, &self.config.target)?;
        self.install(Arc::new(snapshot));

        let duration_secs = started.elapsed().as_secs_f64();
        let record = TrainingRunRecord {
            timestamp: trained_at,
            target: self.config.target.clone(),
            feature_identity: self.extractor.schema().identity.clone(),
            metrics: metrics.clone(),
            best_model: best_model.clone(),
            ensemble_weights: weights.clone(),
            samples_used: train_x.len() + val_x.len(),
            duration_secs,
            blob_checksum: saved.checksum.clone(),
        };
        self.append_history(record);

        Ok(TrainOutcome::Trained(TrainingReport {
            trained_at,
            models_trained,
            skipped_models,
            metrics,
            best_model,
            ensemble_weights: weights,
            train_samples: train_x.len(),
            validation_samples: val_x.len(),
            records_skipped: dataset.skipped,
            duration_secs,
            blob_checksum: saved.checksum,
        }))
    }

    /// History is kept in memory even if the file cannot be rewritten
    fn append_history(&self, record: TrainingRunRecord) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        history.push(record);
        if let Err(e) = self.store.save_history(&history) {
            warn!(error = %e, "Failed to persist training history");
        }
    }

    pub fn history(&self) -> Vec<TrainingRunRecord> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Predict the quality score for a feature map
    ///
    /// Loads persisted models on first use. Without any models the result
    /// has mode [`PredictionMode::NoModel`] and zero confidence.
    pub fn predict(&self, features: &FeatureMap, use_ensemble: bool) -> Prediction {
        match self.current_or_load() {
            Some(snapshot) => snapshot.predict(features, use_ensemble),
            None => Prediction::unavailable(),
        }
    }

    pub fn info(&self) -> ModelInfo {
        let snapshot = self.current_or_load();
        let schedules_available = self.corpus.count_all().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count schedules");
            0
        });
        self.metrics.set_corpus_size(schedules_available);
        let decision = self.retrain_decision();
        let training_runs = self
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        let (models_loaded, best_model, best_model_metrics, ensemble_weights, last_trained) =
            match &snapshot {
                Some(s) => (
                    s.model_names(),
                    Some(s.best_model.clone()),
                    s.best().map(|m| m.metrics),
                    s.weights.clone(),
                    Some(s.last_trained),
                ),
                None => (Vec::new(), None, None, BTreeMap::new(), None),
            };

        ModelInfo {
            models_loaded,
            best_model,
            best_model_metrics,
            ensemble_enabled: self.config.use_ensemble && !ensemble_weights.is_empty(),
            ensemble_weights,
            last_trained,
            should_retrain: decision.due,
            schedules_available,
            training_runs,
            phase: self.phase(),
            features: self.extractor.schema().names.clone(),
            feature_identity: self.extractor.schema().identity.clone(),
        }
    }
}

/// Seeded shuffle, then the first `ceil(n * fraction)` rows validate
///
/// Both sides keep at least one row once two or more rows exist; a single
/// row is used for both.
fn split_indices(n: usize, fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    if n < 2 {
        return (indices.clone(), indices);
    }

    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.2
    };
    let validation = ((n as f64 * fraction).ceil() as usize).clamp(1, n - 1);
    let train = indices.split_off(validation);
    (train, indices)
}

fn select_rows(dataset: &Dataset, indices: &[usize]) -> (Vec<Vec<f64>>, Vec<f64>) {
    indices
        .iter()
        .map(|&i| (dataset.x[i].clone(), dataset.y[i]))
        .unzip()
}
