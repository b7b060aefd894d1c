//! Subject-wise train/test split
//!
//! Partitions by person, never by row, so no subject contributes days to both
//! sides. The assignment depends only on the set of subject ids and the seed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::PipelineError;

/// Subjects assigned to each partition, both sorted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSplit {
    pub random_state: u64,
    pub test_size: f64,
    pub train_subjects: Vec<String>,
    pub test_subjects: Vec<String>,
}

impl SubjectSplit {
    /// Split distinct subject ids, holding out `ceil(n * test_size)` of them
    ///
    /// With at least two subjects both partitions are non-empty.
    pub fn new<'a, I>(subjects: I, test_size: f64, random_state: u64) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(PipelineError::Config(format!(
                "test_size must be in (0, 1), got {test_size}"
            )));
        }

        let unique: BTreeSet<&str> = subjects.into_iter().collect();
        let mut shuffled: Vec<&str> = unique.into_iter().collect();
        let n = shuffled.len();

        let mut rng = StdRng::seed_from_u64(random_state);
        shuffled.shuffle(&mut rng);

        let n_test = if n < 2 {
            0
        } else {
            ((n as f64 * test_size).ceil() as usize).clamp(1, n - 1)
        };

        let mut test_subjects: Vec<String> = shuffled[..n_test].iter().map(|s| s.to_string()).collect();
        let mut train_subjects: Vec<String> = shuffled[n_test..].iter().map(|s| s.to_string()).collect();
        test_subjects.sort();
        train_subjects.sort();

        Ok(Self {
            random_state,
            test_size,
            train_subjects,
            test_subjects,
        })
    }

    pub fn is_test(&self, subject_id: &str) -> bool {
        self.test_subjects
            .binary_search_by(|s| s.as_str().cmp(subject_id))
            .is_ok()
    }

    pub fn is_train(&self, subject_id: &str) -> bool {
        self.train_subjects
            .binary_search_by(|s| s.as_str().cmp(subject_id))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("S{i:02}")).collect()
    }

    #[test]
    fn test_partitions_are_disjoint_and_complete() {
        let ids = subjects(20);
        let split = SubjectSplit::new(ids.iter().map(String::as_str), 0.25, 42).unwrap();

        assert_eq!(split.test_subjects.len(), 5);
        assert_eq!(split.train_subjects.len(), 15);
        for id in &ids {
            assert!(split.is_test(id) != split.is_train(id), "{id} in both or neither");
        }
    }

    #[test]
    fn test_split_is_deterministic_and_ignores_row_multiplicity() {
        let ids = subjects(10);
        let repeated: Vec<&str> = ids.iter().chain(ids.iter()).map(String::as_str).collect();

        let a = SubjectSplit::new(ids.iter().map(String::as_str), 0.3, 7).unwrap();
        let b = SubjectSplit::new(repeated, 0.3, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_small_populations() {
        let one = SubjectSplit::new(["S1"], 0.2, 42).unwrap();
        assert!(one.test_subjects.is_empty());
        assert_eq!(one.train_subjects, vec!["S1"]);

        let two = SubjectSplit::new(["S1", "S2"], 0.9, 42).unwrap();
        assert_eq!(two.test_subjects.len(), 1);
        assert_eq!(two.train_subjects.len(), 1);
    }

    #[test]
    fn test_rejects_bad_test_size() {
        assert!(SubjectSplit::new(["S1", "S2"], 0.0, 42).is_err());
        assert!(SubjectSplit::new(["S1", "S2"], 1.5, 42).is_err());
    }
}
