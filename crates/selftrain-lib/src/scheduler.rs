//! Background retraining loop
//!
//! The loop ticks every `check_interval_minutes` and runs a non-forced
//! training cycle on the blocking pool. Errors and panics inside one cycle are
//! logged and the loop keeps going. Stopping waits for an in-flight run.

use crate::health::{components, HealthRegistry};
use crate::observability::{ServiceMetrics, StructuredLogger};
use crate::trainer::{ModelInfo, ModelTrainer, TrainOutcome, TrainingError};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub check_interval_minutes: u64,
    pub retrain_interval_hours: u64,
    pub model_info: ModelInfo,
}

struct LoopHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the retraining loop; construct once and share by `Arc`
pub struct RetrainingService {
    trainer: Arc<ModelTrainer>,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: ServiceMetrics,
    check_interval: Duration,
    handle: Mutex<Option<LoopHandle>>,
}

impl RetrainingService {
    pub fn new(trainer: Arc<ModelTrainer>, health: HealthRegistry, logger: StructuredLogger) -> Self {
        let check_interval = trainer.config().check_interval();
        Self {
            trainer,
            health,
            logger,
            metrics: ServiceMetrics::new(),
            check_interval,
            handle: Mutex::new(None),
        }
    }

    /// Override the loop period
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn trainer(&self) -> &Arc<ModelTrainer> {
        &self.trainer
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the loop; returns false if it was already running
    pub async fn start(self: &Arc<Self>) -> bool {
        {
            let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
            if handle.is_some() {
                warn!("Retraining service already running");
                return false;
            }
            let (shutdown, receiver) = broadcast::channel(1);
            let task = tokio::spawn(Arc::clone(self).run(receiver));
            *handle = Some(LoopHandle { shutdown, task });
        }

        self.health.set_healthy(components::SCHEDULER).await;
        if self.trainer.snapshot().is_some() {
            self.health.set_healthy(components::TRAINER).await;
        } else {
            self.health
                .set_degraded(components::TRAINER, "No trained models yet")
                .await;
        }
        true
    }

    /// Signal the loop and wait for it to exit; a no-op when stopped
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            debug!("Retraining service not running");
            return;
        };

        let _ = handle.shutdown.send(());
        if let Err(e) = handle.task.await {
            error!(error = %e, "Retraining loop ended abnormally");
        }
        self.health
            .set_degraded(components::SCHEDULER, "Retraining loop stopped")
            .await;
        info!("Retraining service stopped");
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            retrain_interval_hours = self.trainer.config().retrain_interval_hours,
            "Starting retraining loop"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down retraining loop");
                    break;
                }
            }
        }
    }

    async fn run_cycle(&self) {
        let trainer = Arc::clone(&self.trainer);
        let result = tokio::task::spawn_blocking(move || trainer.train(false)).await;
        self.handle_result("scheduled", result).await;
    }

    /// Train immediately, bypassing the retrain trigger
    ///
    /// Safe to call while the loop is running; runs are serialized by the
    /// trainer.
    pub async fn force_retrain(&self) -> Result<TrainOutcome, TrainingError> {
        let trainer = Arc::clone(&self.trainer);
        let result = tokio::task::spawn_blocking(move || trainer.train(true)).await;
        self.handle_result("forced", result).await
    }

    async fn handle_result(
        &self,
        trigger: &str,
        result: Result<Result<TrainOutcome, TrainingError>, JoinError>,
    ) -> Result<TrainOutcome, TrainingError> {
        let result = match result {
            Ok(inner) => inner,
            Err(e) if e.is_panic() => {
                error!(trigger, "Training task panicked");
                Err(TrainingError::Interrupted("training task panicked".to_string()))
            }
            Err(e) => Err(TrainingError::Interrupted(e.to_string())),
        };

        match &result {
            Ok(TrainOutcome::Trained(report)) => {
                let (r2, rmse) = report
                    .best_metrics()
                    .map(|m| (m.validation_r2, m.validation_rmse))
                    .unwrap_or((0.0, 0.0));
                self.logger.log_training_completed(
                    trigger,
                    &report.models_trained,
                    Some(report.best_model.as_str()),
                    r2,
                    rmse,
                    report.ensemble_weights.len(),
                    report.samples_used(),
                );
                self.health.set_healthy(components::TRAINER).await;
            }
            Ok(TrainOutcome::NotNeeded { reason }) => {
                debug!(trigger, reason = %reason, "Retraining not due");
            }
            Ok(TrainOutcome::InsufficientData {
                required,
                available,
            }) => {
                self.logger.log_training_skipped(
                    trigger,
                    &format!("insufficient data: {available} of {required} schedules"),
                );
            }
            Err(e) => {
                self.logger.log_training_failed(trigger, &e.to_string());
                if trigger == "scheduled" {
                    self.metrics.inc_retrain_loop_errors();
                }
                self.health
                    .set_degraded(components::TRAINER, format!("Last training run failed: {e}"))
                    .await;
            }
        }
        result
    }

    /// Blocking: reads the corpus and may load persisted models
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            check_interval_minutes: self.check_interval.as_secs() / 60,
            retrain_interval_hours: self.trainer.config().retrain_interval_hours,
            model_info: self.trainer.info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::corpus::ScheduleCorpus;
    use crate::health::ComponentStatus;
    use crate::trainer::TrainerPhase;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(dir: &TempDir, schedules: usize) -> Arc<RetrainingService> {
        let config = TrainingConfig {
            data_dir: dir.path().join("schedules"),
            model_dir: dir.path().join("models"),
            min_schedules_for_training: 100,
            ..Default::default()
        };
        let corpus = Arc::new(ScheduleCorpus::new(&config.data_dir).unwrap());
        for i in 0..schedules {
            corpus
                .save(&json!({"schedule_id": format!("S{i}"), "trainsets": []}), None)
                .unwrap();
        }
        let trainer = Arc::new(ModelTrainer::new(config, corpus).unwrap());
        Arc::new(
            RetrainingService::new(trainer, HealthRegistry::new(), StructuredLogger::new("test"))
                .with_check_interval(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 3);

        assert!(!service.is_running());
        assert!(service.start().await);
        assert!(service.is_running());
        assert!(!service.start().await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        service.stop().await;
        assert!(!service.is_running());

        // Idempotent
        service.stop().await;
        let scheduler = service.health.component(components::SCHEDULER).await.unwrap();
        assert_eq!(scheduler.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_force_retrain_reports_insufficient_data() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 40);

        let outcome = service.force_retrain().await.unwrap();
        match outcome {
            TrainOutcome::InsufficientData {
                required,
                available,
            } => {
                assert_eq!(required, 100);
                assert_eq!(available, 40);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(service.trainer().snapshot().is_none());
    }

    #[tokio::test]
    async fn test_status_reports_configuration() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 5);

        let status = service.status();
        assert!(!status.running);
        // Sub-minute test interval
        assert_eq!(status.check_interval_minutes, 0);
        assert_eq!(status.retrain_interval_hours, 48);
        assert_eq!(status.model_info.schedules_available, 5);
        assert!(status.model_info.should_retrain);
        assert!(status.model_info.models_loaded.is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_effective_check_interval() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            data_dir: dir.path().join("schedules"),
            model_dir: dir.path().join("models"),
            check_interval_minutes: 60,
            ..Default::default()
        };
        let corpus = Arc::new(ScheduleCorpus::new(&config.data_dir).unwrap());
        let trainer = Arc::new(ModelTrainer::new(config, corpus).unwrap());

        let service = RetrainingService::new(
            Arc::clone(&trainer),
            HealthRegistry::new(),
            StructuredLogger::new("test"),
        );
        assert_eq!(service.status().check_interval_minutes, 60);

        let service = service.with_check_interval(Duration::from_secs(300));
        assert_eq!(service.status().check_interval_minutes, 5);
    }

    #[tokio::test]
    async fn test_force_retrain_while_loop_runs() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 120);

        assert!(service.start().await);
        let outcome = service.force_retrain().await.unwrap();
        assert!(matches!(outcome, TrainOutcome::Trained(_)));

        // Let the loop tick against the fresh model
        tokio::time::sleep(Duration::from_millis(60)).await;
        service.stop().await;

        let trainer = service.trainer();
        assert!(trainer.snapshot().is_some());
        assert!(!trainer.history().is_empty());
        assert_eq!(trainer.phase(), TrainerPhase::Idle);
        let health = service.health.component(components::TRAINER).await.unwrap();
        assert_eq!(health.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_start_marks_trainer_degraded_without_models() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, 0);

        service.start().await;
        let trainer = service.health.component(components::TRAINER).await.unwrap();
        assert_eq!(trainer.status, ComponentStatus::Degraded);
        service.stop().await;
    }
}
