//! Model bundles
//!
//! The trained classifier is produced outside this crate. What the pipeline
//! owns is the bundle around it: the exact feature columns the model was fit
//! on, its evaluation record and an opaque model payload tagged with its kind.
//! A majority-class model is provided so that the registry and the inference
//! path can run without an external trainer.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, DatasetRow};
use crate::error::PipelineError;
use crate::labels::CLASS_NAMES;
use crate::metrics::{evaluate, majority_class, EvaluationMetrics};
use crate::split::SubjectSplit;
use crate::types::{Mode, Target};

/// Model kind tag of [`MajorityClassModel`] payloads
pub const MAJORITY_MODEL_KIND: &str = "majority_class";

/// A classifier over aligned feature vectors
pub trait Classifier {
    /// Predict the class of one aligned feature vector
    fn predict(&self, features: &[Option<f64>]) -> u8;

    /// Class probabilities, if the model provides them
    fn predict_proba(&self, _features: &[Option<f64>]) -> Option<[f64; 3]> {
        None
    }
}

/// Always predicts the most frequent training class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MajorityClassModel {
    pub class: u8,
    pub class_counts: [usize; 3],
}

impl MajorityClassModel {
    pub fn fit(labels: &[u8]) -> Result<Self, PipelineError> {
        let class = majority_class(labels)
            .ok_or_else(|| PipelineError::Evaluation("no training labels".to_string()))?;
        let mut class_counts = [0; 3];
        for &label in labels {
            class_counts[label as usize] += 1;
        }
        Ok(Self {
            class,
            class_counts,
        })
    }

    /// Reject payloads whose class has no label name
    fn checked(self) -> Result<Self, PipelineError> {
        if self.class as usize >= CLASS_NAMES.len() {
            return Err(PipelineError::Config(format!(
                "majority model predicts class {} outside 0..{}",
                self.class,
                CLASS_NAMES.len()
            )));
        }
        Ok(self)
    }
}

impl Classifier for MajorityClassModel {
    fn predict(&self, _features: &[Option<f64>]) -> u8 {
        self.class
    }

    fn predict_proba(&self, _features: &[Option<f64>]) -> Option<[f64; 3]> {
        let total: usize = self.class_counts.iter().sum();
        if total == 0 {
            return None;
        }
        Some(self.class_counts.map(|c| c as f64 / total as f64))
    }
}

/// Everything registered for one model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub name: String,
    pub target: Target,
    pub mode: Mode,
    /// Feature columns in the order the model expects them
    pub feature_columns: Vec<String>,
    pub n_train: usize,
    pub n_test: usize,
    /// Absent when the test partition of the dataset is empty
    pub metrics: Option<EvaluationMetrics>,
    pub model_kind: String,
    pub model: serde_json::Value,
}

impl ModelBundle {
    /// Fit a majority-class model on the train partition and score it on the test partition
    ///
    /// Fails with [`PipelineError::Evaluation`] when the train partition is
    /// empty. An empty test partition leaves the metrics absent.
    pub fn majority_baseline(dataset: &Dataset, split: &SubjectSplit) -> Result<Self, PipelineError> {
        let (train, test) = dataset.partition(split);
        let train_labels = labels(&train);
        let model = MajorityClassModel::fit(&train_labels).map_err(|_| {
            PipelineError::Evaluation(format!("{} has no rows for train subjects", dataset.name))
        })?;

        let metrics = if test.is_empty() {
            warn!("{} has no rows for test subjects; metrics not computed", dataset.name);
            None
        } else {
            let y_true = labels(&test);
            let y_pred: Vec<u8> = test.iter().map(|row| model.predict(&row.features)).collect();
            Some(evaluate(&y_true, &y_pred, &train_labels)?)
        };

        Ok(Self {
            name: format!("{}_majority", dataset.name),
            target: dataset.target,
            mode: dataset.mode(),
            feature_columns: dataset.feature_columns(),
            n_train: train.len(),
            n_test: test.len(),
            metrics,
            model_kind: MAJORITY_MODEL_KIND.to_string(),
            model: serde_json::to_value(&model)?,
        })
    }

    /// Instantiate the payload as an in-process classifier
    pub fn classifier(&self) -> Result<Box<dyn Classifier>, PipelineError> {
        match self.model_kind.as_str() {
            MAJORITY_MODEL_KIND => {
                let model: MajorityClassModel = serde_json::from_value(self.model.clone())?;
                Ok(Box::new(model.checked()?))
            }
            other => Err(PipelineError::Config(format!(
                "model '{}' has kind '{other}' with no in-process classifier",
                self.name
            ))),
        }
    }
}

fn labels(rows: &[&DatasetRow]) -> Vec<u8> {
    rows.iter().map(|row| row.label).collect()
}
