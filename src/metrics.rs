//! Evaluation metrics
//!
//! The metrics record stored with every registered model: accuracy,
//! balanced accuracy, macro F1 and the majority-class baseline.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const N_CLASSES: usize = 3;

/// Evaluation record of one trained model on its test partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub macro_f1: f64,
    /// Accuracy of always predicting the train partition's majority class
    pub majority_baseline_accuracy: f64,
    pub majority_class: u8,
    pub n_train: usize,
    pub n_test: usize,
}

/// Most frequent class; ties go to the lower class
pub fn majority_class(labels: &[u8]) -> Option<u8> {
    if labels.is_empty() {
        return None;
    }
    let counts = class_counts(labels);
    let mut best = 0;
    for class in 1..N_CLASSES {
        if counts[class] > counts[best] {
            best = class;
        }
    }
    Some(best as u8)
}

fn class_counts(labels: &[u8]) -> [usize; N_CLASSES] {
    let mut counts = [0; N_CLASSES];
    for &label in labels {
        counts[label as usize] += 1;
    }
    counts
}

/// Score predictions against the truth
///
/// Balanced accuracy averages recall over classes present in `y_true`; macro
/// F1 averages over classes present in either vector, scoring 0 where
/// precision or recall is undefined.
pub fn evaluate(
    y_true: &[u8],
    y_pred: &[u8],
    train_labels: &[u8],
) -> Result<EvaluationMetrics, PipelineError> {
    if y_true.len() != y_pred.len() {
        return Err(PipelineError::Evaluation(format!(
            "{} predictions for {} labels",
            y_pred.len(),
            y_true.len()
        )));
    }
    if y_true.is_empty() {
        return Err(PipelineError::Evaluation("empty test partition".to_string()));
    }
    if let Some(bad) = y_true.iter().chain(y_pred).chain(train_labels).find(|&&c| c as usize >= N_CLASSES) {
        return Err(PipelineError::Evaluation(format!("label {bad} outside 0..{N_CLASSES}")));
    }
    let majority = majority_class(train_labels)
        .ok_or_else(|| PipelineError::Evaluation("empty train partition".to_string()))?;

    let mut confusion = [[0usize; N_CLASSES]; N_CLASSES];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        confusion[t as usize][p as usize] += 1;
    }

    let n = y_true.len() as f64;
    let correct: usize = (0..N_CLASSES).map(|c| confusion[c][c]).sum();

    let mut recalls = Vec::new();
    let mut f1s = Vec::new();
    for class in 0..N_CLASSES {
        let tp = confusion[class][class] as f64;
        let support: usize = confusion[class].iter().sum();
        let predicted: usize = (0..N_CLASSES).map(|t| confusion[t][class]).sum();

        if support > 0 {
            recalls.push(tp / support as f64);
        }
        if support > 0 || predicted > 0 {
            let denom = support as f64 + predicted as f64;
            f1s.push(if tp > 0.0 { 2.0 * tp / denom } else { 0.0 });
        }
    }

    let baseline_hits = y_true.iter().filter(|&&t| t == majority).count();

    Ok(EvaluationMetrics {
        accuracy: correct as f64 / n,
        balanced_accuracy: mean(&recalls),
        macro_f1: mean(&f1s),
        majority_baseline_accuracy: baseline_hits as f64 / n,
        majority_class: majority,
        n_train: train_labels.len(),
        n_test: y_true.len(),
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
