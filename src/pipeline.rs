//! Pipeline orchestration
//!
//! Stages run in order and hand each other plain values:
//!
//! 1. `MasterTableLoader` - raw extracts to one row per subject-day
//! 2. `LabelDeriver` - 3-class energy and mood stability labels
//! 3. `FeatureSchema` - allow-listed Mode-A columns
//! 4. `LagBuilder` - previous-day labels, re-verified
//! 5. `DatasetAssembler` - the four (target × mode) datasets
//! 6. `SubjectSplit` - subject-wise train/test assignment
//! 7. `ArtifactStore` - atomic persistence

use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dataset::{dataset_name, Dataset, DatasetAssembler};
use crate::encoder::FeatureSchema;
use crate::error::PipelineError;
use crate::inference::Predictor;
use crate::labels::LabelDeriver;
use crate::lags::LagBuilder;
use crate::loader::MasterTableLoader;
use crate::metrics::EvaluationMetrics;
use crate::model::ModelBundle;
use crate::split::SubjectSplit;
use crate::store::{ArtifactStore, FileArtifactStore};
use crate::types::{Field, MasterTable, Mode, Target};

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Datasets built from one master table
#[derive(Debug, Clone)]
pub struct FeatureBuild {
    /// Mode-A schema; Mode B is derived from it
    pub schema: FeatureSchema,
    pub datasets: Vec<Dataset>,
    pub split: SubjectSplit,
}

/// Run the in-memory stages on a master table.
///
/// The split is drawn over every subject of the master table so that all
/// four datasets share one train/test assignment.
pub fn build_datasets(
    master: &MasterTable,
    config: &PipelineConfig,
) -> Result<FeatureBuild, PipelineError> {
    let samples = LabelDeriver::derive(master);
    let schema = FeatureSchema::mode_a(&config.feasible_features, master.columns())?;
    let lags = LagBuilder::build(&samples)?;
    let datasets = DatasetAssembler::assemble_all(&samples, &lags, &schema)?;

    let subjects: BTreeSet<&str> = master
        .records()
        .iter()
        .map(|r| r.key.subject_id.as_str())
        .collect();
    let split = SubjectSplit::new(subjects, config.test_size, config.random_state)?;
    info!(
        "Split {} subjects: {} train, {} test",
        split.train_subjects.len() + split.test_subjects.len(),
        split.train_subjects.len(),
        split.test_subjects.len()
    );

    Ok(FeatureBuild {
        schema,
        datasets,
        split,
    })
}

/// Name under which the majority baseline of a dataset is registered
pub fn baseline_model_name(target: Target, mode: Mode) -> String {
    format!("{}_majority", dataset_name(target, mode))
}

/// Row and class counts of one written dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub rows: usize,
    pub feature_columns: Vec<String>,
    pub class_counts: [usize; 3],
}

impl From<&Dataset> for DatasetSummary {
    fn from(dataset: &Dataset) -> Self {
        Self {
            name: dataset.name.clone(),
            rows: dataset.len(),
            feature_columns: dataset.feature_columns(),
            class_counts: dataset.class_counts(),
        }
    }
}

/// What a feature run produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub master_rows: usize,
    pub subjects: usize,
    pub datasets: Vec<DatasetSummary>,
    pub train_subjects: Vec<String>,
    pub test_subjects: Vec<String>,
}

/// One registered baseline model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredModel {
    pub name: String,
    pub version: u32,
    pub n_train: usize,
    pub n_test: usize,
    pub metrics: Option<EvaluationMetrics>,
}

/// Pipeline bound to a configuration and an artifact store
pub struct FeaturePipeline<S: ArtifactStore> {
    config: PipelineConfig,
    store: S,
}

impl FeaturePipeline<FileArtifactStore> {
    /// Pipeline writing to a file store under `config.output_path`
    pub fn from_config(config: PipelineConfig) -> Self {
        let store = FileArtifactStore::new(&config.output_path)
            .with_retries(config.max_write_retries, RETRY_DELAY);
        Self::new(config, store)
    }
}

impl<S: ArtifactStore> FeaturePipeline<S> {
    pub fn new(config: PipelineConfig, store: S) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Build the master table from the raw extracts and persist it
    pub fn backfill(&self) -> Result<MasterTable, PipelineError> {
        let master = MasterTableLoader::load(&self.config)?;
        info!(
            "Master table: {} rows, {} subjects",
            master.len(),
            master.subject_count()
        );
        self.store
            .write_master_table(&self.config.feature_group_name, &master.to_table())?;
        Ok(master)
    }

    /// Read the persisted master table
    pub fn master_table(&self) -> Result<MasterTable, PipelineError> {
        let table = self
            .store
            .read_master_table(&self.config.feature_group_name)?;
        MasterTable::from_table(&table)
    }

    /// Build and write the four datasets from the persisted master table
    pub fn features(&self) -> Result<RunReport, PipelineError> {
        let master = self.master_table()?;
        self.write_features(&master)
    }

    /// Backfill, then build and write the datasets
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let master = self.backfill()?;
        self.write_features(&master)
    }

    fn write_features(&self, master: &MasterTable) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let build = build_datasets(master, &self.config)?;

        for dataset in &build.datasets {
            self.store
                .write_dataset(&dataset.to_table(), &dataset.manifest(&build.split, &run_id))?;
        }
        info!("Run {} wrote {} datasets", run_id, build.datasets.len());

        Ok(RunReport {
            run_id,
            master_rows: master.len(),
            subjects: master.subject_count(),
            datasets: build.datasets.iter().map(DatasetSummary::from).collect(),
            train_subjects: build.split.train_subjects,
            test_subjects: build.split.test_subjects,
        })
    }

    /// Fit and register a majority-class model for every dataset
    ///
    /// A dataset with no rows for train subjects cannot be fit and is skipped;
    /// the others are still registered.
    pub fn register_baselines(&self) -> Result<Vec<RegisteredModel>, PipelineError> {
        let master = self.master_table()?;
        let build = build_datasets(&master, &self.config)?;

        let mut registered = Vec::with_capacity(build.datasets.len());
        for dataset in &build.datasets {
            let bundle = match ModelBundle::majority_baseline(dataset, &build.split) {
                Ok(bundle) => bundle,
                Err(PipelineError::Evaluation(message)) => {
                    warn!("Skipping baseline for {}: {}", dataset.name, message);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let version = self.store.register_model(&bundle)?;
            match &bundle.metrics {
                Some(m) => info!(
                    "{} v{}: accuracy {:.3}, balanced {:.3}, macro F1 {:.3}",
                    bundle.name, version, m.accuracy, m.balanced_accuracy, m.macro_f1
                ),
                None => info!("{} v{}: no test rows, unscored", bundle.name, version),
            }
            registered.push(RegisteredModel {
                name: bundle.name,
                version,
                n_train: bundle.n_train,
                n_test: bundle.n_test,
                metrics: bundle.metrics,
            });
        }
        Ok(registered)
    }

    /// Predictor over the latest registered baseline of every (target, mode)
    pub fn predictor(&self) -> Result<Predictor, PipelineError> {
        let mut bundles = Vec::new();
        for target in Target::ALL {
            for mode in Mode::ALL {
                bundles.push(self.store.load_model(&baseline_model_name(target, mode), None)?);
            }
        }
        Predictor::new(self.mode_a_schema()?, bundles)
    }

    /// Mode-A schema over every canonical field
    ///
    /// Inference has no master table to check the allow-list against, so only
    /// the names themselves are validated here.
    pub fn mode_a_schema(&self) -> Result<FeatureSchema, PipelineError> {
        FeatureSchema::mode_a(&self.config.feasible_features, &Field::ALL.into_iter().collect())
    }
}

/// Validate `config`, then run the whole pipeline against the file store it names
pub fn run_pipeline(config: PipelineConfig) -> Result<RunReport, PipelineError> {
    config.validate()?;
    FeaturePipeline::from_config(config).run()
}
