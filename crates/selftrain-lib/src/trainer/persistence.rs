//! On-disk model blobs and training history
//!
//! Every successful run writes a timestamped archive plus `models_latest.json`
//! (both via temp file + rename) and rewrites `training_history.json`.

use super::ensemble::{EnsembleSnapshot, ModelEntry};
use super::metrics::ValidationMetrics;
use super::TrainingRunRecord;
use crate::features::FeatureSchema;
use crate::regressors::{ModelError, ModelRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bumped whenever the blob layout changes incompatibly
pub const FORMAT_VERSION: u32 = 1;

const LATEST_FILE: &str = "models_latest.json";
const HISTORY_FILE: &str = "training_history.json";
const ARCHIVE_PREFIX: &str = "models_";
const ARCHIVE_TIMESTAMP: &str = "%Y%m%d_%H%M%S_%6f";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("model blob could not be (de)serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no persisted models at {0}")]
    Missing(PathBuf),
    #[error("unsupported blob format version {0}")]
    UnsupportedFormat(u32),
    #[error("feature schema mismatch: models trained on {found}, service expects {expected}")]
    SchemaMismatch { expected: String, found: String },
    #[error("persisted blob contains no models")]
    Empty,
    #[error("model '{name}' could not be restored: {source}")]
    Model {
        name: String,
        #[source]
        source: ModelError,
    },
}

impl PersistenceError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedModel {
    name: String,
    kind: String,
    metrics: ValidationMetrics,
    state: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEnsemble {
    format_version: u32,
    schema: FeatureSchema,
    target: String,
    models: Vec<PersistedModel>,
    ensemble_weights: BTreeMap<String, f64>,
    best_model: String,
    last_trained: DateTime<Utc>,
}

/// Paths written by a successful save
#[derive(Debug, Clone)]
pub struct SavedBlob {
    pub latest: PathBuf,
    pub archive: PathBuf,
    pub checksum: String,
}

/// Model directory layout and pruning policy
#[derive(Debug, Clone)]
pub struct ModelStore {
    model_dir: PathBuf,
    archives_to_keep: usize,
}

impl ModelStore {
    pub fn new(model_dir: impl Into<PathBuf>, archives_to_keep: usize) -> Result<Self, PersistenceError> {
        let model_dir = model_dir.into();
        fs::create_dir_all(&model_dir).map_err(|e| PersistenceError::io(&model_dir, e))?;
        Ok(Self {
            model_dir,
            archives_to_keep,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.model_dir.join(LATEST_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.model_dir.join(HISTORY_FILE)
    }

    /// Persist a snapshot as archive and latest blob, then prune archives
    pub fn save(&self, snapshot: &EnsembleSnapshot, target: &str) -> Result<SavedBlob, PersistenceError> {
        let models = snapshot
            .models
            .iter()
            .map(|entry| {
                Ok(PersistedModel {
                    name: entry.name.clone(),
                    kind: entry.model.kind().to_string(),
                    metrics: entry.metrics,
                    state: entry.model.to_state().map_err(|source| PersistenceError::Model {
                        name: entry.name.clone(),
                        source,
                    })?,
                })
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        let blob = PersistedEnsemble {
            format_version: FORMAT_VERSION,
            schema: snapshot.schema.clone(),
            target: target.to_string(),
            models,
            ensemble_weights: snapshot.weights.clone(),
            best_model: snapshot.best_model.clone(),
            last_trained: snapshot.last_trained,
        };
        let bytes = serde_json::to_vec(&blob)?;
        let checksum = compute_checksum(&bytes);

        let archive = self.model_dir.join(format!(
            "{ARCHIVE_PREFIX}{}.json",
            snapshot.last_trained.format(ARCHIVE_TIMESTAMP)
        ));
        write_atomic(&archive, &bytes)?;
        let latest = self.latest_path();
        write_atomic(&latest, &bytes)?;

        info!(
            path = %latest.display(),
            archive = %archive.display(),
            size = bytes.len(),
            checksum = %checksum,
            "Model blob saved"
        );

        self.prune_archives();
        Ok(SavedBlob {
            latest,
            archive,
            checksum,
        })
    }

    /// Restore the latest snapshot
    ///
    /// Fails if the blob is absent, unreadable, trained on a different
    /// feature schema, or references a model the registry cannot restore.
    pub fn load_latest(
        &self,
        registry: &ModelRegistry,
        expected: &FeatureSchema,
    ) -> Result<EnsembleSnapshot, PersistenceError> {
        let path = self.latest_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PersistenceError::Missing(path))
            }
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };
        let blob: PersistedEnsemble = serde_json::from_slice(&bytes)?;

        if blob.format_version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedFormat(blob.format_version));
        }
        if blob.schema.identity != expected.identity || !blob.schema.is_consistent() {
            return Err(PersistenceError::SchemaMismatch {
                expected: expected.identity.clone(),
                found: blob.schema.identity,
            });
        }
        if blob.models.is_empty() {
            return Err(PersistenceError::Empty);
        }

        let models = blob
            .models
            .into_iter()
            .map(|persisted| {
                let model = registry
                    .restore(&persisted.kind, persisted.state)
                    .map_err(|source| PersistenceError::Model {
                        name: persisted.name.clone(),
                        source,
                    })?;
                Ok(ModelEntry {
                    name: persisted.name,
                    model,
                    metrics: persisted.metrics,
                })
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        // Weights must refer to loaded models; otherwise fall back to best-model mode
        let weights = if blob
            .ensemble_weights
            .keys()
            .all(|name| models.iter().any(|m| &m.name == name))
        {
            blob.ensemble_weights
        } else {
            warn!("Persisted ensemble weights reference unknown models, ignoring them");
            BTreeMap::new()
        };

        let best_model = if models.iter().any(|m| m.name == blob.best_model) {
            blob.best_model
        } else {
            warn!(best_model = %blob.best_model, "Persisted best model missing, using first model");
            models[0].name.clone()
        };

        debug!(path = %path.display(), models = models.len(), "Model blob loaded");

        Ok(EnsembleSnapshot {
            models,
            weights,
            best_model,
            last_trained: blob.last_trained,
            schema: blob.schema,
        })
    }

    /// Timestamped archives, newest first
    pub fn archives(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        let read_dir =
            fs::read_dir(&self.model_dir).map_err(|e| PersistenceError::io(&self.model_dir, e))?;
        let mut archives: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| {
                        name.starts_with(ARCHIVE_PREFIX)
                            && name.ends_with(".json")
                            && name != LATEST_FILE
                    })
                    .unwrap_or(false)
            })
            .collect();
        archives.sort();
        archives.reverse();
        Ok(archives)
    }

    fn prune_archives(&self) {
        let archives = match self.archives() {
            Ok(archives) => archives,
            Err(e) => {
                warn!(error = %e, "Failed to list model archives");
                return;
            }
        };
        for stale in archives.iter().skip(self.archives_to_keep.max(1)) {
            match fs::remove_file(stale) {
                Ok(()) => debug!(path = %stale.display(), "Removed old model archive"),
                Err(e) => warn!(
                    path = %stale.display(),
                    error = %e,
                    "Failed to remove old model archive"
                ),
            }
        }
    }

    /// Read the training history; a missing file is an empty history
    pub fn load_history(&self) -> Result<Vec<TrainingRunRecord>, PersistenceError> {
        let path = self.history_path();
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    pub fn save_history(&self, history: &[TrainingRunRecord]) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(history)?;
        write_atomic(&self.history_path(), &bytes)
    }
}

/// Write to a sibling temp file, sync, then rename over the target
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).map_err(|e| PersistenceError::io(&temp_path, e))?;
    file.write_all(bytes)
        .map_err(|e| PersistenceError::io(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| PersistenceError::io(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| PersistenceError::io(path, e))?;
    Ok(())
}

/// SHA256 checksum of a serialized blob
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressors::{Hyperparameters, Regressor, RidgeRegressor};
    use tempfile::TempDir;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec!["a".to_string(), "b".to_string()])
    }

    fn trained_snapshot(at: DateTime<Utc>) -> EnsembleSnapshot {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y: Vec<f64> = x.iter().map(|r| 2.0 * r[0] + r[1]).collect();
        let metrics = ValidationMetrics {
            train_r2: 0.99,
            validation_r2: 0.95,
            train_rmse: 0.1,
            validation_rmse: 0.2,
        };

        let mut models = Vec::new();
        for name in ["ridge", "ridge_b"] {
            let mut model = RidgeRegressor::new(&Hyperparameters::default());
            model.fit(&x, &y).unwrap();
            models.push(ModelEntry {
                name: name.to_string(),
                model: Box::new(model),
                metrics,
            });
        }

        let mut weights = BTreeMap::new();
        weights.insert("ridge".to_string(), 0.5);
        weights.insert("ridge_b".to_string(), 0.5);
        EnsembleSnapshot {
            models,
            weights,
            best_model: "ridge".to_string(),
            last_trained: at,
            schema: schema(),
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::with_defaults()
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 5).unwrap();
        let snapshot = trained_snapshot(Utc::now());

        let saved = store.save(&snapshot, "schedule_quality_score").unwrap();
        assert!(saved.latest.exists());
        assert!(saved.archive.exists());
        assert_eq!(saved.checksum.len(), 64);

        let loaded = store.load_latest(&registry(), &schema()).unwrap();
        assert_eq!(loaded.best_model, "ridge");
        assert_eq!(loaded.weights, snapshot.weights);
        assert_eq!(loaded.schema.identity, snapshot.schema.identity);
        assert_eq!(loaded.model_names(), vec!["ridge", "ridge_b"]);

        let row = [4.0, 1.0];
        let before = snapshot.models[0].model.predict(&row);
        let after = loaded.models[0].model.predict(&row);
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn test_load_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 5).unwrap();
        assert!(matches!(
            store.load_latest(&registry(), &schema()),
            Err(PersistenceError::Missing(_))
        ));
    }

    #[test]
    fn test_load_corrupt_blob() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 5).unwrap();
        fs::write(store.latest_path(), b"{not json").unwrap();
        assert!(matches!(
            store.load_latest(&registry(), &schema()),
            Err(PersistenceError::Serialize(_))
        ));
    }

    #[test]
    fn test_load_rejects_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 5).unwrap();
        store.save(&trained_snapshot(Utc::now()), "q").unwrap();

        let other = FeatureSchema::new(vec!["b".to_string(), "a".to_string()]);
        assert!(matches!(
            store.load_latest(&registry(), &other),
            Err(PersistenceError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_load_unknown_model_kind() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 5).unwrap();
        store.save(&trained_snapshot(Utc::now()), "q").unwrap();

        assert!(matches!(
            store.load_latest(&ModelRegistry::empty(), &schema()),
            Err(PersistenceError::Model { .. })
        ));
    }

    #[test]
    fn test_archives_pruned() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 2).unwrap();
        let base = Utc::now();
        for i in 0..4 {
            let snapshot = trained_snapshot(base + chrono::Duration::seconds(i));
            store.save(&snapshot, "q").unwrap();
        }

        let archives = store.archives().unwrap();
        assert_eq!(archives.len(), 2);
        let newest = format!(
            "models_{}.json",
            (base + chrono::Duration::seconds(3)).format(ARCHIVE_TIMESTAMP)
        );
        assert!(archives[0].ends_with(newest));
        assert!(store.latest_path().exists());
    }

    #[test]
    fn test_history_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), 2).unwrap();
        assert!(store.load_history().unwrap().is_empty());
    }
}
