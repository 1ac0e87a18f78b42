//! One-shot operator commands run against the local corpus and model store

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use selftrain_lib::{
    HybridRouter, ModelTrainer, ScheduleCorpus, ScheduleRequest, TrainOutcome, TrainingConfig,
};
use std::path::Path;
use std::sync::Arc;

use crate::output::{
    print_info, print_json, print_success, print_table, print_warning, HistoryRow, ModelRow,
    OutputFormat,
};

pub fn open_trainer(config: &TrainingConfig) -> Result<Arc<ModelTrainer>> {
    let corpus = ScheduleCorpus::new(&config.data_dir).with_context(|| {
        format!("Failed to open schedule corpus at {}", config.data_dir.display())
    })?;
    let trainer = ModelTrainer::new(config.clone(), Arc::new(corpus))
        .context("Failed to initialise model trainer")?;
    Ok(Arc::new(trainer))
}

/// Run a training pass; `force` skips the retrain gates
pub async fn train(config: &TrainingConfig, force: bool, format: OutputFormat) -> Result<()> {
    let trainer = open_trainer(config)?;
    let outcome = tokio::task::spawn_blocking(move || trainer.train(force))
        .await
        .context("Training task panicked")??;

    if let OutputFormat::Json = format {
        return print_json(&outcome);
    }

    match outcome {
        TrainOutcome::Trained(report) => {
            print_success(&format!(
                "Trained {} models on {} samples in {:.1}s",
                report.models_trained.len(),
                report.samples_used(),
                report.duration_secs
            ));
            print_table(&ModelRow::from_report(&report), format)?;
            for (name, reason) in &report.skipped_models {
                print_warning(&format!("Skipped {}: {}", name, reason));
            }
            if report.records_skipped > 0 {
                print_warning(&format!(
                    "{} corpus records could not be decoded",
                    report.records_skipped
                ));
            }
            println!("Checksum: {}", report.blob_checksum.dimmed());
        }
        TrainOutcome::NotNeeded { reason } => {
            print_info(&format!("Retraining not needed: {}", reason));
        }
        TrainOutcome::InsufficientData {
            required,
            available,
        } => {
            print_warning(&format!(
                "Not enough schedules to train: {} available, {} required",
                available, required
            ));
        }
    }

    Ok(())
}

pub fn status(config: &TrainingConfig, format: OutputFormat) -> Result<()> {
    let trainer = open_trainer(config)?;
    let info = trainer.info();
    let decision = trainer.retrain_decision();

    if let OutputFormat::Json = format {
        return print_json(&info);
    }

    println!("{}", "Model Status".bold());
    println!("{}", "=".repeat(50));
    match &info.best_model {
        Some(best) => {
            println!("Models loaded:          {}", info.models_loaded.join(", ").cyan());
            println!("Best model:             {}", best.cyan());
            if let Some(m) = &info.best_model_metrics {
                println!("Validation R²:          {:.3}", m.validation_r2);
                println!("Validation RMSE:        {:.2}", m.validation_rmse);
            }
        }
        None => println!("Models loaded:          {}", "none".yellow()),
    }
    if let Some(last) = info.last_trained {
        println!(
            "Last trained:           {}",
            last.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!(
        "Ensemble:               {}",
        if info.ensemble_enabled { "enabled" } else { "disabled" }
    );
    println!("Schedules available:    {}", info.schedules_available);
    println!("Training runs:          {}", info.training_runs);

    let verdict = if decision.due {
        "due".yellow()
    } else {
        "not due".green()
    };
    println!("Retrain:                {} ({})", verdict, decision.reason);

    Ok(())
}

pub fn history(config: &TrainingConfig, format: OutputFormat) -> Result<()> {
    let trainer = open_trainer(config)?;
    let rows: Vec<HistoryRow> = trainer.history().iter().rev().map(HistoryRow::from).collect();
    print_table(&rows, format)
}

/// Delete all but the newest `keep` schedules
pub fn prune(config: &TrainingConfig, keep: usize, format: OutputFormat) -> Result<()> {
    let corpus = ScheduleCorpus::new(&config.data_dir)?;
    let report = corpus.retain(keep)?;

    if let OutputFormat::Json = format {
        return print_json(&report);
    }

    print_success(&format!(
        "Kept {} schedules, deleted {}",
        report.kept, report.deleted
    ));
    if report.failed > 0 {
        print_warning(&format!("{} files could not be deleted", report.failed));
    }
    Ok(())
}

/// Show where a request of `num_trains` trains would be routed right now
pub fn route(
    config: &TrainingConfig,
    num_trains: Option<u32>,
    ml_available: bool,
    format: OutputFormat,
) -> Result<()> {
    let trainer = open_trainer(config)?;
    let router = HybridRouter::new(trainer.clone(), Arc::clone(trainer.corpus()), config);

    let request = ScheduleRequest {
        num_trains,
        ..Default::default()
    };
    let features = HybridRouter::request_features(&request, Local::now().naive_local());
    let decision = router.decide(&features, ml_available);

    if let OutputFormat::Json = format {
        return print_json(&decision);
    }

    let method = if decision.use_ml {
        decision.method.as_str().green()
    } else {
        decision.method.as_str().yellow()
    };
    println!("Route:        {}", method.bold());
    println!(
        "Confidence:   {:.2} (threshold {:.2})",
        decision.confidence, decision.threshold
    );
    if let Some(quality) = decision.predicted_quality {
        println!("Predicted:    {:.1}", quality);
    }
    println!("Reason:       {}", decision.reason);
    Ok(())
}

/// Add a schedule document to the corpus
pub fn record(config: &TrainingConfig, file: &Path, quality: Option<f64>) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let schedule: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let trainer = open_trainer(config)?;
    let router = HybridRouter::new(trainer.clone(), Arc::clone(trainer.corpus()), config);
    let id = router.record_feedback(&schedule, quality)?;

    print_success(&format!("Recorded schedule {}", id));
    Ok(())
}
