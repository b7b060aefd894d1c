//! mcPHASES features - leakage-safe datasets from wearable and self-report extracts
//!
//! Raw per-subject CSV extracts are turned into training datasets through a
//! deterministic pipeline: master table → labels → feature schema → lag
//! features → datasets → subject-wise split → artifact store.
//!
//! ## Modules
//!
//! - **Loading**: collapse raw extracts into one row per subject-day
//! - **Datasets**: energy and mood stability targets, with (Mode B) and
//!   without (Mode A) previous-day labels as features
//! - **Serving**: model bundles and the inference-time feature contract

pub mod config;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod inference;
pub mod labels;
pub mod lags;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod split;
pub mod store;
pub mod types;

pub use config::PipelineConfig;
pub use dataset::{Dataset, DatasetAssembler, DatasetManifest};
pub use encoder::FeatureSchema;
pub use error::PipelineError;
pub use inference::{InferenceRequest, Predictor, Route};
pub use labels::{LabelDeriver, LABEL_SCHEMA_VERSION};
pub use lags::LagBuilder;
pub use loader::MasterTableLoader;
pub use model::{Classifier, ModelBundle};
pub use pipeline::{build_datasets, run_pipeline, FeaturePipeline, RunReport};
pub use split::SubjectSplit;
pub use store::{ArtifactStore, FileArtifactStore};
pub use types::{DailyRecord, Field, MasterTable, Mode, SubjectDay, Target};

/// Crate version recorded by the CLI
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");
