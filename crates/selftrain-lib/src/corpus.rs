//! Persistent schedule corpus
//!
//! Append-only store of produced schedules used as training ground truth:
//! - One JSON file per saved schedule, never overwritten
//! - Chronologically sortable entry ids
//! - Corrupt or vanishing entries are skipped, not fatal
//! - Retention by keeping the most recent N entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default id used when a schedule carries no `schedule_id`
const DEFAULT_SCHEDULE_ID: &str = "schedule";

/// Attempts at finding a free id before giving up
const MAX_SAVE_ATTEMPTS: usize = 16;

/// In-progress writes; never listed as entries
const PENDING_PREFIX: &str = ".pending_";
const PENDING_EXTENSION: &str = "tmp";

/// Free-form metadata stored alongside a schedule
pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize schedule: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no free entry id after {0} attempts")]
    IdExhausted(usize),
}

impl CorpusError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CorpusError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A persisted schedule with its envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    /// Entry id (file stem); not part of the payload
    #[serde(skip)]
    pub id: String,
    /// The schedule body, opaque to the corpus
    pub schedule: Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub saved_at: DateTime<Utc>,
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetainReport {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// File-backed schedule store
#[derive(Debug)]
pub struct ScheduleCorpus {
    data_dir: PathBuf,
    sequence: AtomicU64,
}

impl ScheduleCorpus {
    /// Open (and create if needed) a corpus rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| CorpusError::io(&data_dir, e))?;
        Ok(Self {
            data_dir,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Persist a schedule and return its entry id
    pub fn save<S>(&self, schedule: &S, metadata: Option<Metadata>) -> Result<String, CorpusError>
    where
        S: Serialize + ?Sized,
    {
        let schedule = serde_json::to_value(schedule)?;
        let schedule_id = schedule
            .get("schedule_id")
            .and_then(Value::as_str)
            .map(sanitize_id)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCHEDULE_ID.to_string());

        let saved_at = Utc::now();
        let entry = CorpusEntry {
            id: String::new(),
            schedule,
            metadata: metadata.unwrap_or_default(),
            saved_at,
        };
        let payload = serde_json::to_vec_pretty(&entry)?;

        // Entries only become visible once fully written
        let pending = self.write_pending(&payload)?;
        let published = self.publish(&pending, &saved_at, &schedule_id);
        if let Err(e) = fs::remove_file(&pending) {
            warn!(path = %pending.display(), error = %e, "Failed to remove pending corpus file");
        }
        published
    }

    /// Write the payload to a fresh file that entry listings ignore
    fn write_pending(&self, payload: &[u8]) -> Result<PathBuf, CorpusError> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let path = self.data_dir.join(format!(
                "{}{}_{}.{}",
                PENDING_PREFIX,
                std::process::id(),
                seq,
                PENDING_EXTENSION
            ));

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(CorpusError::io(&path, e)),
            };
            if let Err(e) = file.write_all(payload).and_then(|_| file.sync_all()) {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(CorpusError::io(&path, e));
            }
            return Ok(path);
        }

        Err(CorpusError::IdExhausted(MAX_SAVE_ATTEMPTS))
    }

    /// Link a pending file under the first free entry id
    fn publish(
        &self,
        pending: &Path,
        saved_at: &DateTime<Utc>,
        schedule_id: &str,
    ) -> Result<String, CorpusError> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 1_000_000;
            let id = format!(
                "{}_{:06}_{}",
                saved_at.format("%Y%m%dT%H%M%S%6f"),
                seq,
                schedule_id
            );
            let path = self.entry_path(&id);

            match fs::hard_link(pending, &path) {
                Ok(()) => {
                    debug!(id = %id, "Schedule saved to corpus");
                    return Ok(id);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(id = %id, "Corpus id taken, retrying with next sequence");
                }
                Err(e) => return Err(CorpusError::io(&path, e)),
            }
        }

        Err(CorpusError::IdExhausted(MAX_SAVE_ATTEMPTS))
    }

    /// Load entries, most recent first
    pub fn load_all(&self, limit: Option<usize>) -> Result<Vec<CorpusEntry>, CorpusError> {
        let mut files = self.entry_files()?;
        if let Some(limit) = limit {
            files.truncate(limit);
        }
        Ok(files.iter().filter_map(|p| self.read_entry(p)).collect())
    }

    /// Total number of stored entries
    pub fn count_all(&self) -> Result<usize, CorpusError> {
        Ok(self.entry_files()?.len())
    }

    /// Entries whose file was modified after `since`
    pub fn load_since(&self, since: DateTime<Utc>) -> Result<Vec<CorpusEntry>, CorpusError> {
        Ok(self
            .files_modified_after(since)?
            .iter()
            .filter_map(|p| self.read_entry(p))
            .collect())
    }

    /// Number of entries whose file was modified after `since`
    pub fn count_since(&self, since: DateTime<Utc>) -> Result<usize, CorpusError> {
        Ok(self.files_modified_after(since)?.len())
    }

    /// Delete all but the `keep_count` most recent entries
    pub fn retain(&self, keep_count: usize) -> Result<RetainReport, CorpusError> {
        let files = self.entry_files()?;
        let mut report = RetainReport {
            kept: files.len().min(keep_count),
            ..Default::default()
        };

        for path in files.iter().skip(keep_count) {
            match fs::remove_file(path) {
                Ok(()) => report.deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Entry already removed");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete corpus entry");
                    report.failed += 1;
                }
            }
        }

        if report.deleted > 0 {
            info!(
                kept = report.kept,
                deleted = report.deleted,
                failed = report.failed,
                "Corpus retention applied"
            );
        }
        Ok(report)
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", id))
    }

    /// Entry files sorted most recent first
    fn entry_files(&self) -> Result<Vec<PathBuf>, CorpusError> {
        let dir = fs::read_dir(&self.data_dir).map_err(|e| CorpusError::io(&self.data_dir, e))?;
        let mut files: Vec<PathBuf> = dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(files)
    }

    fn files_modified_after(&self, since: DateTime<Utc>) -> Result<Vec<PathBuf>, CorpusError> {
        Ok(self
            .entry_files()?
            .into_iter()
            .filter(|path| match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified) > since,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat corpus entry");
                    false
                }
            })
            .collect())
    }

    fn read_entry(&self, path: &Path) -> Option<CorpusEntry> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable corpus entry");
                return None;
            }
        };
        match serde_json::from_slice::<CorpusEntry>(&bytes) {
            Ok(mut entry) => {
                entry.id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some(entry)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping corrupt corpus entry");
                None
            }
        }
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn corpus() -> (TempDir, ScheduleCorpus) {
        let temp_dir = TempDir::new().unwrap();
        let corpus = ScheduleCorpus::new(temp_dir.path().join("schedules")).unwrap();
        (temp_dir, corpus)
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, corpus) = corpus();
        let mut metadata = Metadata::new();
        metadata.insert("quality_score".to_string(), json!(81.5));

        let id = corpus
            .save(&json!({"schedule_id": "S-1", "trainsets": []}), Some(metadata))
            .unwrap();
        assert!(id.ends_with("_S-1"));

        let entries = corpus.load_all(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].schedule["schedule_id"], json!("S-1"));
        assert_eq!(entries[0].metadata["quality_score"], json!(81.5));
    }

    #[test]
    fn test_same_id_never_overwrites() {
        let (_dir, corpus) = corpus();
        let schedule = json!({"schedule_id": "dup"});
        let ids: Vec<String> = (0..20).map(|_| corpus.save(&schedule, None).unwrap()).collect();

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 20);
        assert_eq!(corpus.count_all().unwrap(), 20);
    }

    #[test]
    fn test_default_and_sanitized_ids() {
        let (_dir, corpus) = corpus();
        let id = corpus.save(&json!({"trainsets": []}), None).unwrap();
        assert!(id.ends_with("_schedule"));

        let id = corpus.save(&json!({"schedule_id": "../etc/x"}), None).unwrap();
        assert!(!id.contains('/'));
    }

    #[test]
    fn test_save_leaves_only_entry_files() {
        let (_dir, corpus) = corpus();
        for i in 0..3 {
            corpus.save(&json!({"schedule_id": format!("s{}", i)}), None).unwrap();
        }

        let names: Vec<String> = fs::read_dir(corpus.data_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }

    #[test]
    fn test_partial_write_is_not_an_entry() {
        let (_dir, corpus) = corpus();
        corpus.save(&json!({"schedule_id": "ok"}), None).unwrap();
        // Left behind by a write interrupted before publishing
        fs::write(
            corpus.data_dir().join(".pending_1_7.tmp"),
            br#"{"schedule": {"schedule_id": "hal"#,
        )
        .unwrap();

        assert_eq!(corpus.count_all().unwrap(), 1);
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(corpus.count_since(cutoff).unwrap(), 1);
        assert_eq!(corpus.load_all(None).unwrap().len(), 1);
    }

    #[test]
    fn test_save_into_missing_directory_fails_cleanly() {
        let (_dir, corpus) = corpus();
        fs::remove_dir_all(corpus.data_dir()).unwrap();
        assert!(matches!(
            corpus.save(&json!({"schedule_id": "lost"}), None),
            Err(CorpusError::Io { .. })
        ));
    }

    #[test]
    fn test_load_all_most_recent_first_with_limit() {
        let (_dir, corpus) = corpus();
        for i in 0..5 {
            corpus.save(&json!({"schedule_id": format!("s{}", i)}), None).unwrap();
        }
        let entries = corpus.load_all(Some(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].schedule["schedule_id"], json!("s4"));
        assert_eq!(entries[1].schedule["schedule_id"], json!("s3"));
    }

    #[test]
    fn test_corrupt_entry_skipped() {
        let (_dir, corpus) = corpus();
        corpus.save(&json!({"schedule_id": "ok"}), None).unwrap();
        fs::write(corpus.data_dir().join("zzz_broken.json"), b"{not json").unwrap();

        assert_eq!(corpus.count_all().unwrap(), 2);
        let entries = corpus.load_all(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].schedule["schedule_id"], json!("ok"));
    }

    #[test]
    fn test_retain_keeps_most_recent() {
        let (_dir, corpus) = corpus();
        for i in 0..5 {
            corpus.save(&json!({"schedule_id": format!("s{}", i)}), None).unwrap();
        }

        let report = corpus.retain(2).unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.failed, 0);

        let ids: Vec<Value> = corpus
            .load_all(None)
            .unwrap()
            .into_iter()
            .map(|e| e.schedule["schedule_id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("s4"), json!("s3")]);
    }

    #[test]
    fn test_load_since() {
        let (_dir, corpus) = corpus();
        corpus.save(&json!({"schedule_id": "old"}), None).unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(corpus.count_since(cutoff).unwrap(), 1);
        assert_eq!(corpus.load_since(cutoff).unwrap().len(), 1);

        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(corpus.count_since(future).unwrap(), 0);
        assert!(corpus.load_since(future).unwrap().is_empty());
    }
}
