//! Pipeline configuration
//!
//! Settings are read from an optional JSON file and then overridden by
//! `MCPHASES_*` environment variables. Every field has a default except the
//! raw data directory, which must be supplied one way or the other.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::types::Field;

/// Default seed for the subject-wise split
pub const DEFAULT_RANDOM_STATE: u64 = 42;

/// Default fraction of subjects held out for testing
pub const DEFAULT_TEST_SIZE: f64 = 0.2;

/// Default name of the master table / feature group
pub const DEFAULT_FEATURE_GROUP: &str = "mcphases_daily_fg";

/// Columns a user can realistically report or read off a wearable each day
pub const DEFAULT_FEASIBLE_FEATURES: [&str; 8] = [
    "is_weekend",
    "sleep_duration_minutes",
    "resting_heart_rate__value",
    "cramps_num",
    "headaches_num",
    "sleepissue_num",
    "stress_num",
    "phase",
];

/// Maps one raw column of an extract onto a canonical field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Column name in the raw CSV
    pub source: String,
    /// Canonical master-table field
    pub field: Field,
    /// Multiplier applied to numeric values (e.g. 60.0 for hours to minutes)
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl ColumnMapping {
    pub fn new(source: &str, field: Field) -> Self {
        Self {
            source: source.to_string(),
            field,
            scale: 1.0,
        }
    }

    pub fn scaled(source: &str, field: Field, scale: f64) -> Self {
        Self {
            source: source.to_string(),
            field,
            scale,
        }
    }
}

/// One raw CSV extract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// File name relative to the data directory
    pub file: String,
    #[serde(default = "default_subject_column")]
    pub subject_column: String,
    #[serde(default = "default_day_column")]
    pub day_column: String,
    pub columns: Vec<ColumnMapping>,
}

fn default_subject_column() -> String {
    "id".to_string()
}

fn default_day_column() -> String {
    "day_in_study".to_string()
}

impl SourceSpec {
    pub fn new(file: &str, columns: Vec<ColumnMapping>) -> Self {
        Self {
            file: file.to_string(),
            subject_column: default_subject_column(),
            day_column: default_day_column(),
            columns,
        }
    }
}

/// The mcPHASES extracts used by default
pub fn default_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec::new(
            "hormones_and_selfreport.csv",
            vec![
                ColumnMapping::new("phase", Field::Phase),
                ColumnMapping::new("is_weekend", Field::IsWeekend),
                ColumnMapping::new("fatigue", Field::Fatigue),
                ColumnMapping::new("moodswing", Field::Moodswing),
                ColumnMapping::new("cramps", Field::Cramps),
                ColumnMapping::new("headaches", Field::Headaches),
                ColumnMapping::new("sleepissue", Field::SleepIssue),
                ColumnMapping::new("stress", Field::Stress),
            ],
        ),
        SourceSpec::new(
            "sleep.csv",
            vec![ColumnMapping::new("minutesasleep", Field::SleepDurationMinutes)],
        ),
        SourceSpec::new(
            "resting_heart_rate.csv",
            vec![
                ColumnMapping::new("value", Field::RestingHeartRate),
                ColumnMapping::new("timestamp", Field::EventTimestamp),
            ],
        ),
    ]
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the raw CSV extracts
    pub data_path: PathBuf,
    /// Root directory of the artifact store
    pub output_path: PathBuf,
    pub sources: Vec<SourceSpec>,
    /// Allow-list of master-table columns used as Mode-A features
    pub feasible_features: Vec<String>,
    pub random_state: u64,
    pub test_size: f64,
    pub feature_group_name: String,
    /// Retries for transient write failures
    pub max_write_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::new(),
            output_path: PathBuf::from("artifacts"),
            sources: default_sources(),
            feasible_features: DEFAULT_FEASIBLE_FEATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            random_state: DEFAULT_RANDOM_STATE,
            test_size: DEFAULT_TEST_SIZE,
            feature_group_name: DEFAULT_FEATURE_GROUP.to_string(),
            max_write_retries: 3,
        }
    }
}

impl PipelineConfig {
    /// Load from an optional JSON file, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut config = match path {
            Some(path) => Self::from_json(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `MCPHASES_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MCPHASES_DATA_PATH") {
            self.data_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MCPHASES_OUTPUT_PATH") {
            self.output_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MCPHASES_RANDOM_STATE") {
            self.random_state = v.trim().parse().map_err(|_| {
                PipelineError::Config(format!("MCPHASES_RANDOM_STATE must be an integer, got {v:?}"))
            })?;
        }
        if let Some(v) = lookup("MCPHASES_TEST_SIZE") {
            self.test_size = v.trim().parse().map_err(|_| {
                PipelineError::Config(format!("MCPHASES_TEST_SIZE must be a number, got {v:?}"))
            })?;
        }
        if let Some(v) = lookup("MCPHASES_FEATURE_GROUP") {
            self.feature_group_name = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut missing = Vec::new();
        if self.data_path.as_os_str().is_empty() {
            missing.push("data_path (MCPHASES_DATA_PATH)");
        }
        if self.output_path.as_os_str().is_empty() {
            missing.push("output_path (MCPHASES_OUTPUT_PATH)");
        }
        if !missing.is_empty() {
            return Err(PipelineError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(PipelineError::Config(format!(
                "test_size must be in (0, 1), got {}",
                self.test_size
            )));
        }
        if self.sources.is_empty() {
            return Err(PipelineError::Config("no sources configured".to_string()));
        }
        if self.feasible_features.is_empty() {
            return Err(PipelineError::Config(
                "feasible_features must not be empty".to_string(),
            ));
        }
        if self.feature_group_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "feature_group_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_require_data_path() {
        let config = PipelineConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("data_path"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MCPHASES_DATA_PATH", "/data/mcphases"),
            ("MCPHASES_RANDOM_STATE", "7"),
            ("MCPHASES_TEST_SIZE", "0.25"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_path, PathBuf::from("/data/mcphases"));
        assert_eq!(config.random_state, 7);
        assert!((config.test_size - 0.25).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "MCPHASES_TEST_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json(
            r#"{
                "data_path": "raw",
                "test_size": 0.3,
                "sources": [{
                    "file": "sleep.csv",
                    "columns": [{ "source": "hours", "field": "sleep_duration_minutes", "scale": 60.0 }]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.random_state, DEFAULT_RANDOM_STATE);
        assert_eq!(config.sources[0].subject_column, "id");
        assert_eq!(config.sources[0].columns[0].field, Field::SleepDurationMinutes);
        assert_eq!(config.sources[0].columns[0].scale, 60.0);
        assert_eq!(config.feasible_features.len(), DEFAULT_FEASIBLE_FEATURES.len());
    }

    #[test]
    fn test_rejects_out_of_range_test_size() {
        let config = PipelineConfig {
            data_path: PathBuf::from("raw"),
            test_size: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
