//! Feature extraction for schedule quality models
//!
//! Extracts coarse operational features and the composite quality target
//! from a schedule record. Extraction never fails: absent data falls back to
//! neutral defaults, and only records that cannot be decoded at all are
//! dropped from a dataset.

use crate::models::{FeatureMap, ScheduleRecord, TrainsetStatus};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Hour used when the generation timestamp cannot be parsed
pub const DEFAULT_HOUR: f64 = 12.0;

/// Day of week used when the generation timestamp cannot be parsed
pub const DEFAULT_DAY: f64 = 0.0;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Ordered feature list plus a stable identity hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub names: Vec<String>,
    pub identity: String,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Self {
        let identity = schema_identity(&names);
        Self { names, identity }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// True if the stored identity still matches the names
    pub fn is_consistent(&self) -> bool {
        schema_identity(&self.names) == self.identity
    }

    /// Order a feature map by this schema; absent or non-finite values are 0.0
    pub fn vectorize(&self, features: &FeatureMap) -> Vec<f64> {
        self.names
            .iter()
            .map(|name| {
                features
                    .get(name)
                    .copied()
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
            })
            .collect()
    }
}

/// SHA256 over the newline-joined feature names
fn schema_identity(names: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(names.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Feature matrix and target vector ready for training
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub x: Vec<Vec<f64>>,
    pub y: Vec<f64>,
    /// Records dropped because they could not be decoded
    pub skipped: usize,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Extract features from a single schedule
pub fn extract(record: &ScheduleRecord) -> FeatureMap {
    let mut features = FeatureMap::new();
    let trainsets = &record.trainsets;
    let count = trainsets.len();

    features.insert("num_trains".into(), count as f64);

    let revenue = trainsets
        .iter()
        .filter(|t| t.status == TrainsetStatus::RevenueService)
        .count();
    let standby = trainsets
        .iter()
        .filter(|t| t.status == TrainsetStatus::Standby)
        .count();
    let maintenance = trainsets
        .iter()
        .filter(|t| t.status == TrainsetStatus::Maintenance)
        .count();
    features.insert("num_revenue_service".into(), revenue as f64);
    features.insert("num_standby".into(), standby as f64);
    features.insert("num_available".into(), (revenue + standby) as f64);
    features.insert("maintenance_count".into(), maintenance as f64);

    let readiness: Vec<f64> = trainsets
        .iter()
        .map(|t| t.readiness_score.unwrap_or(0.0))
        .collect();
    features.insert("avg_readiness_score".into(), mean(&readiness));
    features.insert(
        "min_readiness_score".into(),
        readiness.iter().copied().reduce(f64::min).unwrap_or(0.0),
    );

    let mileage: Vec<f64> = trainsets
        .iter()
        .map(|t| t.cumulative_km.unwrap_or(0.0))
        .collect();
    features.insert("total_mileage".into(), mileage.iter().sum());
    features.insert("avg_mileage".into(), mean(&mileage));
    features.insert("mileage_variance".into(), population_variance(&mileage));

    let certificate_issues = trainsets
        .iter()
        .flat_map(|t| t.fitness_certificates.values())
        .filter(|c| c.is_issue())
        .count();
    features.insert("certificate_expiry_count".into(), certificate_issues as f64);

    let branding: f64 = trainsets
        .iter()
        .filter_map(|t| t.branding.as_ref())
        .filter_map(|b| b.exposure_priority)
        .map(|p| p.weight())
        .sum();
    features.insert("branding_priority_sum".into(), branding);

    let (hour, day) = record
        .generated_at
        .as_deref()
        .and_then(parse_generated_at)
        .map(|dt| (dt.hour() as f64, dt.weekday().num_days_from_monday() as f64))
        .unwrap_or((DEFAULT_HOUR, DEFAULT_DAY));
    features.insert("time_of_day".into(), hour);
    features.insert("day_of_week".into(), day);

    features
}

/// Composite quality score in [0, 100]
///
/// Readiness (30) + availability (25) + mileage balance (20) + branding
/// compliance (15) + fitness violations (10), each component clamped to its
/// own range.
pub fn compute_target(record: &ScheduleRecord) -> f64 {
    let metrics = &record.optimization_metrics;

    let readiness = metrics.avg_readiness_score.unwrap_or(0.0).clamp(0.0, 1.0) * 30.0;
    let availability = (record.fleet_summary.availability_percent.unwrap_or(0.0) / 100.0)
        .clamp(0.0, 1.0)
        * 25.0;
    let mileage_balance =
        (1.0 - metrics.mileage_variance_coefficient.unwrap_or(1.0)).clamp(0.0, 1.0) * 20.0;
    let branding = metrics.branding_sla_compliance.unwrap_or(0.0).clamp(0.0, 1.0) * 15.0;
    let violations =
        (10.0 - metrics.fitness_expiry_violations.unwrap_or(0.0) * 2.0).clamp(0.0, 10.0);

    let score = readiness + availability + mileage_balance + branding + violations;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

/// Maps schedule records onto a fixed feature order
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
}

impl FeatureExtractor {
    pub fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn vectorize(&self, features: &FeatureMap) -> Vec<f64> {
        self.schema.vectorize(features)
    }

    /// Build the training matrix from raw schedule documents
    ///
    /// Documents wrapped in a corpus envelope (`{"schedule": ...}`) are
    /// unwrapped first.
    pub fn prepare_dataset<'a, I>(&self, records: I) -> Dataset
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut dataset = Dataset::default();

        for raw in records {
            let body = match raw.get("schedule") {
                Some(inner) if inner.is_object() => inner,
                _ => raw,
            };
            match ScheduleRecord::deserialize(body) {
                Ok(record) => {
                    dataset.x.push(self.vectorize(&extract(&record)));
                    dataset.y.push(compute_target(&record));
                }
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable schedule record");
                    dataset.skipped += 1;
                }
            }
        }

        if dataset.skipped > 0 {
            warn!(
                skipped = dataset.skipped,
                usable = dataset.len(),
                "Some schedule records could not be decoded"
            );
        }
        dataset
    }
}

fn parse_generated_at(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}
