//! Dataset assembly
//!
//! Builds the four (target × mode) training datasets from labeled samples,
//! their lag values and the Mode-A feature schema.
//!
//! Rows without a label are dropped since labels are never imputed. Mode-B
//! rows also need both previous-day labels. Null features are kept; median
//! imputation belongs to the training step.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::encoder::FeatureSchema;
use crate::error::PipelineError;
use crate::labels::LABEL_SCHEMA_VERSION;
use crate::split::SubjectSplit;
use crate::types::{format_cell, LabeledSample, LagValues, Mode, SubjectDay, Table, Target};

/// Prefix of every dataset and model name
pub const DATASET_PREFIX: &str = "mcphases";

/// Canonical dataset name, e.g. `mcphases_energy_modea`
pub fn dataset_name(target: Target, mode: Mode) -> String {
    format!("{}_{}_{}", DATASET_PREFIX, target.slug(), mode.slug())
}

/// One labeled training row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub key: SubjectDay,
    pub features: Vec<Option<f64>>,
    pub label: u8,
}

/// A flat dataset for one (target, mode) pair
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub target: Target,
    pub schema: FeatureSchema,
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn mode(&self) -> Mode {
        self.schema.mode
    }

    pub fn feature_columns(&self) -> Vec<String> {
        self.schema.column_names()
    }

    pub fn label_column(&self) -> &'static str {
        self.target.label_column()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct subjects, sorted
    pub fn subjects(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.key.subject_id.as_str()).collect()
    }

    /// Number of rows per class
    pub fn class_counts(&self) -> [usize; 3] {
        let mut counts = [0; 3];
        for row in &self.rows {
            counts[row.label as usize] += 1;
        }
        counts
    }

    /// Rows of the train and test partitions
    pub fn partition<'a>(&'a self, split: &SubjectSplit) -> (Vec<&'a DatasetRow>, Vec<&'a DatasetRow>) {
        self.rows
            .iter()
            .partition(|row| !split.is_test(&row.key.subject_id))
    }

    /// Flatten as keys, feature columns, then the label column
    pub fn to_table(&self) -> Table {
        let mut columns = vec!["subject_id".to_string(), "day_in_study".to_string()];
        columns.extend(self.feature_columns());
        columns.push(self.label_column().to_string());

        let mut table = Table::new(columns);
        for row in &self.rows {
            let mut cells = Vec::with_capacity(row.features.len() + 3);
            cells.push(row.key.subject_id.clone());
            cells.push(row.key.day_in_study.to_string());
            cells.extend(row.features.iter().map(|v| format_cell(*v)));
            cells.push(row.label.to_string());
            table.rows.push(cells);
        }
        table
    }

    /// Describe this dataset for the artifact store
    pub fn manifest(&self, split: &SubjectSplit, run_id: &str) -> DatasetManifest {
        DatasetManifest {
            name: self.name.clone(),
            target: self.target,
            mode: self.mode(),
            feature_columns: self.feature_columns(),
            label_column: self.label_column().to_string(),
            label_schema_version: LABEL_SCHEMA_VERSION.to_string(),
            row_count: self.len(),
            class_counts: self.class_counts(),
            split: split.clone(),
            run_id: run_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Metadata persisted next to every dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub name: String,
    pub target: Target,
    pub mode: Mode,
    pub feature_columns: Vec<String>,
    pub label_column: String,
    pub label_schema_version: String,
    pub row_count: usize,
    pub class_counts: [usize; 3],
    pub split: SubjectSplit,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

/// Assembler for the per-(target, mode) datasets
pub struct DatasetAssembler;

impl DatasetAssembler {
    /// Build all four datasets: energy A, energy B, mood A, mood B
    pub fn assemble_all(
        samples: &[LabeledSample],
        lags: &[LagValues],
        mode_a: &FeatureSchema,
    ) -> Result<Vec<Dataset>, PipelineError> {
        let mode_b = mode_a.to_mode_b();
        let mut datasets = Vec::with_capacity(4);
        for target in Target::ALL {
            for schema in [mode_a, &mode_b] {
                datasets.push(Self::assemble(samples, lags, schema, target)?);
            }
        }
        Ok(datasets)
    }

    /// Build one dataset
    pub fn assemble(
        samples: &[LabeledSample],
        lags: &[LagValues],
        schema: &FeatureSchema,
        target: Target,
    ) -> Result<Dataset, PipelineError> {
        if samples.len() != lags.len() {
            return Err(PipelineError::LeakageInvariant(format!(
                "{} lag rows for {} samples",
                lags.len(),
                samples.len()
            )));
        }

        let mut rows: Vec<DatasetRow> = samples
            .iter()
            .zip(lags)
            .filter(|(_, lag)| schema.mode == Mode::A || lag.is_complete())
            .filter_map(|(sample, lag)| {
                let label = sample.label(target)?;
                Some(DatasetRow {
                    key: sample.key().clone(),
                    features: schema.encode(&sample.record, lag),
                    label,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));

        let dataset = Dataset {
            name: dataset_name(target, schema.mode),
            target,
            schema: schema.clone(),
            rows,
        };
        info!(
            "{}: {} rows, {} features, classes {:?}",
            dataset.name,
            dataset.len(),
            dataset.schema.len(),
            dataset.class_counts()
        );
        Ok(dataset)
    }
}
