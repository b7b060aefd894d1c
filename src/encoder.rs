//! Feature selection and encoding
//!
//! Projects the master table onto an allow-list of user-feasible columns,
//! one-hot encodes the cycle phase and sanitizes every output column name.
//! The same [`FeatureSchema`] encodes training rows and inference requests, so
//! column set, order and naming cannot drift between the two.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::PipelineError;
use crate::types::{DailyRecord, Field, LagValues, Mode, SubjectDay, Target};

/// Canonical phase buckets; indicator columns are emitted in sorted order
pub const PHASE_BUCKETS: [&str; 4] = ["fertility", "follicular", "luteal", "menstrual"];

/// Bucket for a missing or unrecognised phase
pub const PHASE_MISSING: &str = "nan";

/// Allow-list entry that expands into phase indicator columns
pub const PHASE_FEATURE: &str = "phase";

/// Lowercase a name and replace everything outside `[a-z0-9_]` with `_`
pub fn sanitize_column_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// Map a reported phase label onto its canonical bucket
pub fn phase_bucket(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return PHASE_MISSING;
    };
    match raw.trim().to_lowercase().as_str() {
        "menstruation" | "menstrual" | "menses" => "menstrual",
        "late follicular" | "follicular" => "follicular",
        "ovulation" | "fertility" => "fertility",
        "luteal" => "luteal",
        _ => PHASE_MISSING,
    }
}

/// One output column of a feature row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum FeatureColumn {
    /// A numeric master-table field
    Numeric(Field),
    /// 1.0 when the day's phase falls in this bucket
    PhaseIndicator(String),
    /// Previous-day label of a target
    Lag(Target),
}

impl FeatureColumn {
    pub fn name(&self) -> String {
        match self {
            FeatureColumn::Numeric(field) => sanitize_column_name(field.column_name()),
            FeatureColumn::PhaseIndicator(bucket) => {
                sanitize_column_name(&format!("{PHASE_FEATURE}_{bucket}"))
            }
            FeatureColumn::Lag(target) => target.lag_column().to_string(),
        }
    }
}

/// Ordered feature columns for one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub mode: Mode,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    /// Build the Mode-A schema from an allow-list
    ///
    /// Every name must be a column some source provided. Label sources are
    /// rejected outright since they would leak the target.
    pub fn mode_a(
        allow_list: &[String],
        available: &BTreeSet<Field>,
    ) -> Result<Self, PipelineError> {
        let mut columns = Vec::new();
        let mut seen = BTreeSet::new();

        for name in allow_list {
            let name = name.trim();
            if !seen.insert(name.to_string()) {
                return Err(PipelineError::Config(format!(
                    "feature '{name}' listed twice"
                )));
            }
            let field = Field::from_column_name(name)
                .filter(|f| available.contains(f))
                .ok_or_else(|| PipelineError::UnknownFeature(name.to_string()))?;

            if field.is_label_source() {
                return Err(PipelineError::LeakageInvariant(format!(
                    "'{name}' is a label source and cannot be a feature"
                )));
            }

            match field {
                Field::Phase => columns.extend(phase_indicator_columns()),
                Field::EventTimestamp => {
                    return Err(PipelineError::UnknownFeature(name.to_string()));
                }
                _ => columns.push(FeatureColumn::Numeric(field)),
            }
        }

        let schema = Self {
            mode: Mode::A,
            columns,
        };
        schema.check_unique_names()?;
        Ok(schema)
    }

    /// Mode B: the Mode-A columns followed by exactly `lag1_energy, lag1_mood`
    pub fn to_mode_b(&self) -> Self {
        let mut columns: Vec<FeatureColumn> = self
            .columns
            .iter()
            .filter(|c| !matches!(c, FeatureColumn::Lag(_)))
            .cloned()
            .collect();
        columns.extend(Target::ALL.into_iter().map(FeatureColumn::Lag));
        Self {
            mode: Mode::B,
            columns,
        }
    }

    /// Build the schema for a mode
    pub fn for_mode(
        allow_list: &[String],
        available: &BTreeSet<Field>,
        mode: Mode,
    ) -> Result<Self, PipelineError> {
        let schema = Self::mode_a(allow_list, available)?;
        Ok(match mode {
            Mode::A => schema,
            Mode::B => schema.to_mode_b(),
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(FeatureColumn::name).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Encode one record; nulls are kept for downstream imputation
    pub fn encode(&self, record: &DailyRecord, lags: &LagValues) -> Vec<Option<f64>> {
        let bucket = phase_bucket(record.phase.as_deref());
        self.columns
            .iter()
            .map(|column| match column {
                FeatureColumn::Numeric(field) => record.numeric(*field),
                FeatureColumn::PhaseIndicator(b) => Some(if b == bucket { 1.0 } else { 0.0 }),
                FeatureColumn::Lag(target) => lags.get(*target).map(f64::from),
            })
            .collect()
    }

    pub fn encode_row(&self, record: &DailyRecord, lags: &LagValues) -> FeatureRow {
        FeatureRow {
            key: record.key.clone(),
            values: self.encode(record, lags),
        }
    }

    fn check_unique_names(&self) -> Result<(), PipelineError> {
        let mut names = BTreeSet::new();
        for name in self.column_names() {
            if !names.insert(name.clone()) {
                return Err(PipelineError::schema(
                    "feature schema",
                    format!("column name '{name}' produced twice after sanitization"),
                ));
            }
        }
        Ok(())
    }
}

fn phase_indicator_columns() -> Vec<FeatureColumn> {
    let buckets: BTreeSet<String> = PHASE_BUCKETS
        .iter()
        .chain(std::iter::once(&PHASE_MISSING))
        .map(|b| sanitize_column_name(b))
        .collect();
    buckets.into_iter().map(FeatureColumn::PhaseIndicator).collect()
}

/// Encoded features of one subject-day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: SubjectDay,
    pub values: Vec<Option<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn all_fields() -> BTreeSet<Field> {
        Field::ALL.into_iter().collect()
    }

    fn default_allow_list() -> Vec<String> {
        crate::config::DEFAULT_FEASIBLE_FEATURES
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_sanitize_column_name() {
        assert_eq!(sanitize_column_name("Phase_Late Follicular"), "phase_late_follicular");
        assert_eq!(sanitize_column_name("resting_heart_rate__value"), "resting_heart_rate__value");
        assert_eq!(sanitize_column_name("HR (bpm)"), "hr__bpm_");
        assert_eq!(sanitize_column_name("  "), "_");
    }

    #[test]
    fn test_phase_buckets() {
        assert_eq!(phase_bucket(Some("Menstruation")), "menstrual");
        assert_eq!(phase_bucket(Some("Late Follicular")), "follicular");
        assert_eq!(phase_bucket(Some("Ovulation")), "fertility");
        assert_eq!(phase_bucket(Some(" luteal ")), "luteal");
        assert_eq!(phase_bucket(Some("unknown")), "nan");
        assert_eq!(phase_bucket(None), "nan");
    }

    #[test]
    fn test_mode_a_column_order() {
        let schema = FeatureSchema::mode_a(&default_allow_list(), &all_fields()).unwrap();
        assert_eq!(
            schema.column_names(),
            vec![
                "is_weekend",
                "sleep_duration_minutes",
                "resting_heart_rate__value",
                "cramps_num",
                "headaches_num",
                "sleepissue_num",
                "stress_num",
                "phase_fertility",
                "phase_follicular",
                "phase_luteal",
                "phase_menstrual",
                "phase_nan",
            ]
        );
    }

    #[test]
    fn test_mode_b_is_mode_a_plus_lags() {
        let a = FeatureSchema::for_mode(&default_allow_list(), &all_fields(), Mode::A).unwrap();
        let b = FeatureSchema::for_mode(&default_allow_list(), &all_fields(), Mode::B).unwrap();

        let a_names = a.column_names();
        let b_names = b.column_names();
        assert_eq!(&b_names[..a_names.len()], &a_names[..]);
        assert_eq!(&b_names[a_names.len()..], &["lag1_energy", "lag1_mood"]);
        assert_eq!(b.to_mode_b(), b);
    }

    #[test]
    fn test_encoding_is_stable_across_runs() {
        let first = FeatureSchema::mode_a(&default_allow_list(), &all_fields()).unwrap();
        let second = FeatureSchema::mode_a(&default_allow_list(), &all_fields()).unwrap();
        assert_eq!(first.column_names(), second.column_names());
    }

    #[test]
    fn test_unknown_feature() {
        let allow = vec!["stress_num".to_string(), "steps".to_string()];
        let err = FeatureSchema::mode_a(&allow, &all_fields()).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownFeature(name) if name == "steps"));
    }

    #[test]
    fn test_feature_missing_from_loaded_sources() {
        let available: BTreeSet<Field> = [Field::Stress].into_iter().collect();
        let allow = vec!["stress_num".to_string(), "resting_heart_rate__value".to_string()];
        let err = FeatureSchema::mode_a(&allow, &available).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownFeature(_)));
    }

    #[test]
    fn test_label_source_rejected() {
        let allow = vec!["fatigue_num".to_string()];
        let err = FeatureSchema::mode_a(&allow, &all_fields()).unwrap_err();
        assert!(matches!(err, PipelineError::LeakageInvariant(_)));
    }

    #[test]
    fn test_encode_record() {
        let allow = vec!["stress_num".to_string(), "phase".to_string()];
        let schema = FeatureSchema::mode_a(&allow, &all_fields()).unwrap().to_mode_b();

        let mut record = DailyRecord::empty(SubjectDay::new("S1", 2));
        record.phase = Some("Luteal".to_string());
        let lags = LagValues {
            lag1_energy: Some(2),
            lag1_mood: None,
        };

        assert_eq!(
            schema.encode(&record, &lags),
            vec![
                None,
                Some(0.0),
                Some(0.0),
                Some(1.0),
                Some(0.0),
                Some(0.0),
                Some(2.0),
                None
            ]
        );
    }
}
