//! Service configuration
//!
//! Read from an optional file (TOML, YAML or JSON by extension) and
//! `SELFTRAIN_*` environment variables. Nested keys use `__`, e.g.
//! `SELFTRAIN_TRAINING__EPOCHS=50`; list values are comma separated.

use anyhow::{Context, Result};
use selftrain_lib::TrainingConfig;
use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "SELFTRAIN";
const DEFAULT_CONFIG_FILE: &str = "selftrain";

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name attached to structured log events
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Port for health, metrics and status endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub training: TrainingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            training: TrainingConfig::default(),
        }
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "selftrain".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl ServiceConfig {
    /// Load configuration; an explicit path must exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("training.model_types")
                    .with_list_parse_key("training.features"),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
api_port = 9100

[training]
epochs = 25
ml_confidence_threshold = 0.8
model_types = ["ridge", "knn"]
"#
        )
        .unwrap();

        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.training.epochs, 25);
        assert_eq!(config.training.ml_confidence_threshold, 0.8);
        assert_eq!(config.training.model_types, vec!["ridge", "knn"]);
        // Untouched fields keep their defaults
        assert_eq!(config.training.retrain_interval_hours, 48);
        assert_eq!(config.training.features.len(), 10);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ServiceConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
