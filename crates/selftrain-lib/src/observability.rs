//! Observability infrastructure for the self-training service
//!
//! Provides:
//! - Prometheus metrics (training latency and outcomes, routing decisions,
//!   prediction confidence, corpus size, active model)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for training duration (in seconds)
const TRAINING_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Histogram buckets for prediction confidence
const CONFIDENCE_BUCKETS: &[f64] = &[0.5, 0.6, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95, 1.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServiceMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ServiceMetricsInner {
    training_duration_seconds: Histogram,
    training_runs: IntCounterVec,
    routing_decisions: IntCounterVec,
    prediction_confidence: Histogram,
    corpus_schedules: IntGauge,
    models_loaded: IntGauge,
    best_model_info: GaugeVec,
    feedback_recorded: IntCounter,
    retrain_loop_errors: IntCounter,
}

impl ServiceMetricsInner {
    fn new() -> Self {
        Self {
            training_duration_seconds: register_histogram!(
                "selftrain_training_duration_seconds",
                "Wall time of completed training runs",
                TRAINING_BUCKETS.to_vec()
            )
            .expect("Failed to register training_duration_seconds"),

            training_runs: register_int_counter_vec!(
                "selftrain_training_runs_total",
                "Training attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register training_runs_total"),

            routing_decisions: register_int_counter_vec!(
                "selftrain_routing_decisions_total",
                "Routing decisions by selected method",
                &["method"]
            )
            .expect("Failed to register routing_decisions_total"),

            prediction_confidence: register_histogram!(
                "selftrain_prediction_confidence",
                "Confidence of ML quality predictions",
                CONFIDENCE_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_confidence"),

            corpus_schedules: register_int_gauge!(
                "selftrain_corpus_schedules",
                "Number of schedules stored in the training corpus"
            )
            .expect("Failed to register corpus_schedules"),

            models_loaded: register_int_gauge!(
                "selftrain_models_loaded",
                "Number of models in the active ensemble"
            )
            .expect("Failed to register models_loaded"),

            best_model_info: register_gauge_vec!(
                "selftrain_best_model_info",
                "Best model of the active ensemble and its validation R²",
                &["model"]
            )
            .expect("Failed to register best_model_info"),

            feedback_recorded: register_int_counter!(
                "selftrain_feedback_recorded_total",
                "Schedules recorded as training feedback"
            )
            .expect("Failed to register feedback_recorded_total"),

            retrain_loop_errors: register_int_counter!(
                "selftrain_retrain_loop_errors_total",
                "Errors caught inside the background retraining loop"
            )
            .expect("Failed to register retrain_loop_errors_total"),
        }
    }
}

/// Service metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ServiceMetrics {
    _private: (),
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetrics").finish()
    }
}

impl ServiceMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServiceMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ServiceMetricsInner {
        GLOBAL_METRICS.get_or_init(ServiceMetricsInner::new)
    }

    /// Record a training attempt and, for completed runs, its duration
    pub fn record_training(&self, outcome: &str, duration_secs: Option<f64>) {
        self.inner()
            .training_runs
            .with_label_values(&[outcome])
            .inc();
        if let Some(secs) = duration_secs {
            self.inner().training_duration_seconds.observe(secs);
        }
    }

    pub fn record_routing(&self, method: &str) {
        self.inner()
            .routing_decisions
            .with_label_values(&[method])
            .inc();
    }

    pub fn observe_confidence(&self, confidence: f64) {
        self.inner().prediction_confidence.observe(confidence);
    }

    pub fn set_corpus_size(&self, count: usize) {
        self.inner().corpus_schedules.set(count as i64);
    }

    /// Update active model info
    pub fn set_active_models(&self, count: usize, best_model: Option<&str>, best_r2: f64) {
        self.inner().models_loaded.set(count as i64);
        self.inner().best_model_info.reset();
        if let Some(name) = best_model {
            self.inner()
                .best_model_info
                .with_label_values(&[name])
                .set(best_r2);
        }
    }

    pub fn inc_feedback_recorded(&self) {
        self.inner().feedback_recorded.inc();
    }

    pub fn inc_retrain_loop_errors(&self) {
        self.inner().retrain_loop_errors.inc();
    }
}

/// Structured logger for service events
///
/// Provides consistent JSON-formatted logging for training runs, routing
/// decisions and lifecycle events.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a completed training run
    pub fn log_training_completed(
        &self,
        trigger: &str,
        models_trained: &[String],
        best_model: Option<&str>,
        best_r2: f64,
        best_rmse: f64,
        ensemble_size: usize,
        samples_used: usize,
    ) {
        info!(
            event = "training_completed",
            instance = %self.instance,
            trigger = %trigger,
            models_trained = %models_trained.join(","),
            best_model = ?best_model,
            best_r2 = best_r2,
            best_rmse = best_rmse,
            ensemble_size = ensemble_size,
            samples_used = samples_used,
            "Retraining completed"
        );
    }

    /// Log a training attempt that did not run
    pub fn log_training_skipped(&self, trigger: &str, reason: &str) {
        info!(
            event = "training_skipped",
            instance = %self.instance,
            trigger = %trigger,
            reason = %reason,
            "Retraining skipped"
        );
    }

    /// Log a failed training attempt
    pub fn log_training_failed(&self, trigger: &str, error: &str) {
        error!(
            event = "training_failed",
            instance = %self.instance,
            trigger = %trigger,
            error = %error,
            "Retraining failed"
        );
    }

    /// Log a routing decision
    pub fn log_routing_decision(&self, method: &str, confidence: f64, threshold: f64, reason: &str) {
        info!(
            event = "routing_decision",
            instance = %self.instance,
            method = %method,
            confidence = confidence,
            threshold = threshold,
            reason = %reason,
            "Routing decision made"
        );
    }

    /// Log a schedule recorded for training
    pub fn log_feedback_recorded(&self, entry_id: &str, quality_score: Option<f64>) {
        info!(
            event = "feedback_recorded",
            instance = %self.instance,
            entry_id = %entry_id,
            quality_score = ?quality_score,
            "Schedule recorded for training"
        );
    }

    /// Log service startup
    pub fn log_startup(&self, version: &str, retrain_interval_hours: u64, models: &[String]) {
        info!(
            event = "service_started",
            instance = %self.instance,
            service_version = %version,
            retrain_interval_hours = retrain_interval_hours,
            model_types = %models.join(","),
            "Self-training service started"
        );
    }

    /// Log service shutdown
    pub fn log_shutdown(&self, reason: &str) {
        warn!(
            event = "service_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Self-training service shutting down"
        );
    }
}
