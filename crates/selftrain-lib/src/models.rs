//! Core data models for the self-training service
//!
//! Schedule records are produced by the optimizer and stored opaquely by the
//! corpus. They are only decoded into these types at feature-extraction time,
//! with every field optional so missing data falls back to the defaults the
//! extractor applies.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Named numeric features extracted from a schedule
pub type FeatureMap = BTreeMap<String, f64>;

/// One scheduling run as produced by the optimizer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    /// ISO-8601 generation time, optionally with an offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub trainsets: Vec<TrainsetEntry>,
    #[serde(default)]
    pub fleet_summary: FleetSummary,
    #[serde(default)]
    pub optimization_metrics: OptimizationMetrics,
    /// Everything else the optimizer emitted
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-trainset entry of a schedule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainsetEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainset_id: Option<String>,
    #[serde(default)]
    pub status: TrainsetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_km: Option<f64>,
    #[serde(default)]
    pub fitness_certificates: BTreeMap<String, CertificateEntry>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub branding: Option<Branding>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainsetStatus {
    RevenueService,
    Standby,
    Maintenance,
    #[default]
    #[serde(other)]
    Unknown,
}

impl TrainsetStatus {
    /// Revenue service and standby both count towards availability
    pub fn is_available(&self) -> bool {
        matches!(self, TrainsetStatus::RevenueService | TrainsetStatus::Standby)
    }
}

/// A fitness certificate; anything that is not an object is carried but ignored
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CertificateEntry {
    Detailed(CertificateInfo),
    Other(Value),
}

impl CertificateEntry {
    /// Expired or about to expire
    pub fn is_issue(&self) -> bool {
        match self {
            CertificateEntry::Detailed(info) => matches!(
                info.status,
                Some(CertificateStatus::Expired) | Some(CertificateStatus::ExpiringSoon)
            ),
            CertificateEntry::Other(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CertificateStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    Valid,
    Expired,
    ExpiringSoon,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_priority: Option<ExposurePriority>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposurePriority {
    Critical,
    High,
    Medium,
    Low,
    #[serde(rename = "NONE")]
    NoExposure,
    #[serde(other)]
    Unknown,
}

impl ExposurePriority {
    pub fn weight(&self) -> f64 {
        match self {
            ExposurePriority::Critical => 4.0,
            ExposurePriority::High => 3.0,
            ExposurePriority::Medium => 2.0,
            ExposurePriority::Low => 1.0,
            ExposurePriority::NoExposure | ExposurePriority::Unknown => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_percent: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Run-level metrics reported by the optimizer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_readiness_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage_variance_coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branding_sla_compliance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fitness_expiry_violations: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Incoming scheduling request as seen by the router
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_trains: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decode a value leniently: anything that does not fit `T` becomes `None`
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}
