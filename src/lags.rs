//! Lag feature construction
//!
//! `lag1_X` for a row is the label X of the same subject on study day
//! `day_in_study - 1`. A missing previous day gives a null lag; there is no
//! forward fill and no lookback beyond one day.
//!
//! Lags are built by walking each subject's rows in day order and then
//! re-checked against an independent key lookup, so an off-by-subject bug
//! fails the run instead of leaking labels across people.

use log::info;
use std::collections::HashMap;

use crate::error::PipelineError;
use crate::types::{LabeledSample, LagValues, SubjectDay, Target};

/// Builder for previous-day label features
pub struct LagBuilder;

impl LagBuilder {
    /// Compute lag values, returned in the same order as `samples`
    pub fn build(samples: &[LabeledSample]) -> Result<Vec<LagValues>, PipelineError> {
        let lags = compute_lags(samples);
        verify_lags(samples, &lags)?;

        let complete = lags.iter().filter(|l| l.is_complete()).count();
        info!(
            "Lag features: {} of {} rows have both previous-day labels",
            complete,
            samples.len()
        );
        Ok(lags)
    }
}

/// Walk every subject's rows in ascending day order
fn compute_lags(samples: &[LabeledSample]) -> Vec<LagValues> {
    let mut order: Vec<usize> = (0..samples.len()).collect();
    order.sort_by(|&a, &b| samples[a].key().cmp(samples[b].key()));

    let mut lags = vec![LagValues::default(); samples.len()];
    for pair in order.windows(2) {
        let (prev, curr) = (&samples[pair[0]], &samples[pair[1]]);
        let same_subject = prev.key().subject_id == curr.key().subject_id;
        if same_subject && curr.key().day_in_study.checked_sub(1) == Some(prev.key().day_in_study) {
            lags[pair[1]] = LagValues {
                lag1_energy: prev.label(Target::Energy),
                lag1_mood: prev.label(Target::MoodStability),
            };
        }
    }
    lags
}

/// Check every lag against a direct lookup of `(subject_id, day_in_study - 1)`
pub fn verify_lags(samples: &[LabeledSample], lags: &[LagValues]) -> Result<(), PipelineError> {
    if samples.len() != lags.len() {
        return Err(PipelineError::LeakageInvariant(format!(
            "{} lag rows for {} samples",
            lags.len(),
            samples.len()
        )));
    }

    let by_key: HashMap<&SubjectDay, &LabeledSample> =
        samples.iter().map(|s| (s.key(), s)).collect();

    for (sample, lag) in samples.iter().zip(lags) {
        let previous = sample
            .key()
            .previous_day()
            .and_then(|key| by_key.get(&key).copied());
        for target in Target::ALL {
            let expected = previous.and_then(|p| p.label(target));
            if lag.get(target) != expected {
                return Err(PipelineError::LeakageInvariant(format!(
                    "{} for subject {} day {} is {:?}, expected {:?}",
                    target.lag_column(),
                    sample.key().subject_id,
                    sample.key().day_in_study,
                    lag.get(target),
                    expected
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DailyRecord;

    fn sample(subject: &str, day: i64, energy: Option<u8>, mood: Option<u8>) -> LabeledSample {
        LabeledSample {
            record: DailyRecord::empty(SubjectDay::new(subject, day)),
            y_energy_cls3: energy,
            y_mood_stability_cls3: mood,
        }
    }

    #[test]
    fn test_gap_yields_null() {
        let samples = vec![
            sample("S1", 1, Some(0), Some(1)),
            sample("S1", 2, Some(2), Some(2)),
            sample("S1", 4, Some(1), Some(0)),
        ];
        let lags = LagBuilder::build(&samples).unwrap();

        assert_eq!(lags[0], LagValues::default());
        assert_eq!(lags[1].lag1_energy, Some(0));
        assert_eq!(lags[1].lag1_mood, Some(1));
        assert_eq!(lags[2], LagValues::default());
    }

    #[test]
    fn test_no_leakage_across_subjects() {
        // S2 day 3 directly follows S1 day 2 in key order, but must not see it
        let samples = vec![
            sample("S1", 2, Some(2), Some(2)),
            sample("S2", 3, Some(1), Some(1)),
            sample("S2", 4, Some(0), Some(0)),
        ];
        let lags = LagBuilder::build(&samples).unwrap();
        assert_eq!(lags[1], LagValues::default());
        assert_eq!(lags[2].lag1_energy, Some(1));
    }

    #[test]
    fn test_unsorted_input_keeps_row_order() {
        let samples = vec![
            sample("S1", 3, Some(1), Some(1)),
            sample("S2", 1, Some(0), Some(0)),
            sample("S1", 2, Some(2), None),
        ];
        let lags = LagBuilder::build(&samples).unwrap();
        assert_eq!(lags[0].lag1_energy, Some(2));
        assert_eq!(lags[0].lag1_mood, None);
        assert_eq!(lags[1], LagValues::default());
        assert_eq!(lags[2], LagValues::default());
    }

    #[test]
    fn test_null_previous_label_gives_null_lag() {
        let samples = vec![
            sample("S1", 1, None, Some(2)),
            sample("S1", 2, Some(1), Some(1)),
        ];
        let lags = LagBuilder::build(&samples).unwrap();
        assert_eq!(lags[1].lag1_energy, None);
        assert_eq!(lags[1].lag1_mood, Some(2));
        assert!(!lags[1].is_complete());
    }

    #[test]
    fn test_extreme_day_indices_do_not_overflow() {
        let samples = vec![
            sample("S1", i64::MIN, Some(1), Some(2)),
            sample("S1", i64::MIN + 1, Some(0), Some(0)),
            sample("S1", i64::MAX, Some(2), Some(2)),
        ];
        let lags = LagBuilder::build(&samples).unwrap();
        assert_eq!(lags[0], LagValues::default());
        assert_eq!(lags[1].lag1_energy, Some(1));
        assert_eq!(lags[1].lag1_mood, Some(2));
        assert_eq!(lags[2], LagValues::default());
    }

    #[test]
    fn test_verify_catches_cross_subject_lag() {
        let samples = vec![
            sample("S1", 1, Some(2), Some(2)),
            sample("S2", 2, Some(0), Some(0)),
        ];
        let bad = vec![
            LagValues::default(),
            LagValues {
                lag1_energy: Some(2),
                lag1_mood: Some(2),
            },
        ];
        let err = verify_lags(&samples, &bad).unwrap_err();
        match err {
            PipelineError::LeakageInvariant(msg) => {
                assert!(msg.contains("subject S2 day 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
