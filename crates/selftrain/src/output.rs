//! Terminal output for the operator commands

use clap::ValueEnum;
use colored::Colorize;
use selftrain_lib::{TrainingReport, TrainingRunRecord};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// One model's scores in a training run
#[derive(Tabled, Serialize)]
pub struct ModelRow {
    #[tabled(rename = "Model")]
    pub model: String,
    #[tabled(rename = "Val R²")]
    pub validation_r2: String,
    #[tabled(rename = "Val RMSE")]
    pub validation_rmse: String,
    #[tabled(rename = "Train R²")]
    pub train_r2: String,
    #[tabled(rename = "Weight")]
    pub weight: String,
}

impl ModelRow {
    pub fn from_report(report: &TrainingReport) -> Vec<Self> {
        report
            .metrics
            .iter()
            .map(|(name, m)| {
                let marker = if *name == report.best_model { " *" } else { "" };
                ModelRow {
                    model: format!("{name}{marker}"),
                    validation_r2: format!("{:.3}", m.validation_r2),
                    validation_rmse: format!("{:.2}", m.validation_rmse),
                    train_r2: format!("{:.3}", m.train_r2),
                    weight: report
                        .ensemble_weights
                        .get(name)
                        .map(|w| format!("{w:.3}"))
                        .unwrap_or_else(|| "-".to_string()),
                }
            })
            .collect()
    }
}

/// One completed training run
#[derive(Tabled, Serialize)]
pub struct HistoryRow {
    #[tabled(rename = "Trained At")]
    pub timestamp: String,
    #[tabled(rename = "Best Model")]
    pub best_model: String,
    #[tabled(rename = "Val R²")]
    pub validation_r2: String,
    #[tabled(rename = "Samples")]
    pub samples: usize,
    #[tabled(rename = "Models")]
    pub models: usize,
    #[tabled(rename = "Duration")]
    pub duration: String,
}

impl From<&TrainingRunRecord> for HistoryRow {
    fn from(record: &TrainingRunRecord) -> Self {
        Self {
            timestamp: record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            best_model: record.best_model.clone(),
            validation_r2: record
                .metrics
                .get(&record.best_model)
                .map(|m| format!("{:.3}", m.validation_r2))
                .unwrap_or_else(|| "-".to_string()),
            samples: record.samples_used,
            models: record.metrics.len(),
            duration: format!("{:.1}s", record.duration_secs),
        }
    }
}

pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
            } else {
                println!("{}", Table::new(items).with(Style::rounded()));
            }
            Ok(())
        }
        OutputFormat::Json => print_json(items),
    }
}
