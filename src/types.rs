//! Core types for the mcPHASES feature pipeline
//!
//! This module defines the values that flow between pipeline stages: the
//! canonical master-table columns, daily records, labeled samples, and the
//! flat string tables handed to the artifact store.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::PipelineError;

/// Canonical master-table column, independent of any raw extract's naming
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "event_timestamp")]
    EventTimestamp,
    #[serde(rename = "phase")]
    Phase,
    #[serde(rename = "is_weekend")]
    IsWeekend,
    #[serde(rename = "sleep_duration_minutes")]
    SleepDurationMinutes,
    #[serde(rename = "resting_heart_rate__value")]
    RestingHeartRate,
    #[serde(rename = "stress_num")]
    Stress,
    #[serde(rename = "cramps_num")]
    Cramps,
    #[serde(rename = "headaches_num")]
    Headaches,
    #[serde(rename = "sleepissue_num")]
    SleepIssue,
    #[serde(rename = "fatigue_num")]
    Fatigue,
    #[serde(rename = "moodswing_num")]
    Moodswing,
}

/// How raw cells of a field are interpreted and collapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Parsed as a date-time; first non-null value wins
    Timestamp,
    /// Free text; most frequent value wins
    Categorical,
    /// Plain number; same-day samples are averaged
    Numeric,
    /// Self-report 0-5 scale, numeric or text; same-day samples are averaged
    Ordinal,
}

impl Field {
    /// Every canonical field in master-table column order
    pub const ALL: [Field; 11] = [
        Field::EventTimestamp,
        Field::Phase,
        Field::IsWeekend,
        Field::SleepDurationMinutes,
        Field::RestingHeartRate,
        Field::Stress,
        Field::Cramps,
        Field::Headaches,
        Field::SleepIssue,
        Field::Fatigue,
        Field::Moodswing,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Field::EventTimestamp => "event_timestamp",
            Field::Phase => "phase",
            Field::IsWeekend => "is_weekend",
            Field::SleepDurationMinutes => "sleep_duration_minutes",
            Field::RestingHeartRate => "resting_heart_rate__value",
            Field::Stress => "stress_num",
            Field::Cramps => "cramps_num",
            Field::Headaches => "headaches_num",
            Field::SleepIssue => "sleepissue_num",
            Field::Fatigue => "fatigue_num",
            Field::Moodswing => "moodswing_num",
        }
    }

    pub fn from_column_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.column_name() == name)
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::EventTimestamp => FieldKind::Timestamp,
            Field::Phase => FieldKind::Categorical,
            Field::IsWeekend | Field::SleepDurationMinutes | Field::RestingHeartRate => {
                FieldKind::Numeric
            }
            Field::Stress
            | Field::Cramps
            | Field::Headaches
            | Field::SleepIssue
            | Field::Fatigue
            | Field::Moodswing => FieldKind::Ordinal,
        }
    }

    /// Fields that feed label derivation and must never be used as features
    pub fn is_label_source(&self) -> bool {
        matches!(self, Field::Fatigue | Field::Moodswing)
    }
}

/// Primary key of the master table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectDay {
    pub subject_id: String,
    pub day_in_study: i64,
}

impl SubjectDay {
    pub fn new(subject_id: impl Into<String>, day_in_study: i64) -> Self {
        Self {
            subject_id: subject_id.into(),
            day_in_study,
        }
    }

    /// Key of the immediately preceding study day for the same subject
    pub fn previous_day(&self) -> Option<SubjectDay> {
        Some(SubjectDay {
            subject_id: self.subject_id.clone(),
            day_in_study: self.day_in_study.checked_sub(1)?,
        })
    }
}

/// One collapsed row of the master table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub key: SubjectDay,
    /// Event timestamp of the day's samples, if any source carried one
    pub event_timestamp: Option<NaiveDateTime>,
    /// Raw cycle phase label as reported
    pub phase: Option<String>,
    /// 1 on Saturday/Sunday, 0 otherwise
    pub is_weekend: Option<f64>,
    /// Sleep duration (minutes)
    pub sleep_duration_minutes: Option<f64>,
    /// Resting heart rate (bpm)
    pub resting_heart_rate: Option<f64>,
    pub stress: Option<f64>,
    pub cramps: Option<f64>,
    pub headaches: Option<f64>,
    pub sleep_issue: Option<f64>,
    /// Self-reported fatigue (0-5), energy label source
    pub fatigue: Option<f64>,
    /// Self-reported moodswing (0-5), mood stability label source
    pub moodswing: Option<f64>,
}

impl DailyRecord {
    pub fn empty(key: SubjectDay) -> Self {
        Self {
            key,
            event_timestamp: None,
            phase: None,
            is_weekend: None,
            sleep_duration_minutes: None,
            resting_heart_rate: None,
            stress: None,
            cramps: None,
            headaches: None,
            sleep_issue: None,
            fatigue: None,
            moodswing: None,
        }
    }

    /// Numeric value of a field; `None` for null cells and non-numeric fields
    pub fn numeric(&self, field: Field) -> Option<f64> {
        match field {
            Field::EventTimestamp | Field::Phase => None,
            Field::IsWeekend => self.is_weekend,
            Field::SleepDurationMinutes => self.sleep_duration_minutes,
            Field::RestingHeartRate => self.resting_heart_rate,
            Field::Stress => self.stress,
            Field::Cramps => self.cramps,
            Field::Headaches => self.headaches,
            Field::SleepIssue => self.sleep_issue,
            Field::Fatigue => self.fatigue,
            Field::Moodswing => self.moodswing,
        }
    }

    pub fn set_numeric(&mut self, field: Field, value: Option<f64>) {
        let slot = match field {
            Field::EventTimestamp | Field::Phase => return,
            Field::IsWeekend => &mut self.is_weekend,
            Field::SleepDurationMinutes => &mut self.sleep_duration_minutes,
            Field::RestingHeartRate => &mut self.resting_heart_rate,
            Field::Stress => &mut self.stress,
            Field::Cramps => &mut self.cramps,
            Field::Headaches => &mut self.headaches,
            Field::SleepIssue => &mut self.sleep_issue,
            Field::Fatigue => &mut self.fatigue,
            Field::Moodswing => &mut self.moodswing,
        };
        *slot = value;
    }
}

/// The master table: unique keys, sorted by `(subject_id, day_in_study)`
#[derive(Debug, Clone, PartialEq)]
pub struct MasterTable {
    records: Vec<DailyRecord>,
    columns: BTreeSet<Field>,
}

impl MasterTable {
    /// Build a master table, rejecting duplicate keys
    ///
    /// `columns` lists the fields some source actually provided; features may
    /// only be selected from these.
    pub fn new(
        mut records: Vec<DailyRecord>,
        columns: BTreeSet<Field>,
    ) -> Result<Self, PipelineError> {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(pair) = records.windows(2).find(|w| w[0].key == w[1].key) {
            return Err(PipelineError::DuplicateKey {
                stage: "master_table".to_string(),
                subject_id: pair[0].key.subject_id.clone(),
                day_in_study: pair[0].key.day_in_study,
            });
        }
        Ok(Self { records, columns })
    }

    pub fn records(&self) -> &[DailyRecord] {
        &self.records
    }

    pub fn columns(&self) -> &BTreeSet<Field> {
        &self.columns
    }

    pub fn has_column(&self, field: Field) -> bool {
        self.columns.contains(&field)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of distinct subjects
    pub fn subject_count(&self) -> usize {
        let mut count = 0;
        let mut last: Option<&str> = None;
        for record in &self.records {
            if last != Some(record.key.subject_id.as_str()) {
                count += 1;
                last = Some(record.key.subject_id.as_str());
            }
        }
        count
    }
}

/// Prediction target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Energy,
    MoodStability,
}

impl Target {
    pub const ALL: [Target; 2] = [Target::Energy, Target::MoodStability];

    pub fn label_column(&self) -> &'static str {
        match self {
            Target::Energy => "y_energy_cls3",
            Target::MoodStability => "y_mood_stability_cls3",
        }
    }

    pub fn lag_column(&self) -> &'static str {
        match self {
            Target::Energy => "lag1_energy",
            Target::MoodStability => "lag1_mood",
        }
    }

    /// Short name used in dataset and model names
    pub fn slug(&self) -> &'static str {
        match self {
            Target::Energy => "energy",
            Target::MoodStability => "mood",
        }
    }
}

/// Feature-set variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Wearables and same-day self-report only
    #[serde(rename = "mode_a")]
    A,
    /// Mode A plus previous-day labels
    #[serde(rename = "mode_b")]
    B,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::A, Mode::B];

    pub fn slug(&self) -> &'static str {
        match self {
            Mode::A => "modea",
            Mode::B => "modeb",
        }
    }
}

/// Three-class ordinal labels attached to a daily record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub record: DailyRecord,
    pub y_energy_cls3: Option<u8>,
    pub y_mood_stability_cls3: Option<u8>,
}

impl LabeledSample {
    pub fn key(&self) -> &SubjectDay {
        &self.record.key
    }

    pub fn label(&self, target: Target) -> Option<u8> {
        match target {
            Target::Energy => self.y_energy_cls3,
            Target::MoodStability => self.y_mood_stability_cls3,
        }
    }
}

/// Previous-day label values for one sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagValues {
    pub lag1_energy: Option<u8>,
    pub lag1_mood: Option<u8>,
}

impl LagValues {
    pub fn get(&self, target: Target) -> Option<u8> {
        match target {
            Target::Energy => self.lag1_energy,
            Target::MoodStability => self.lag1_mood,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lag1_energy.is_some() && self.lag1_mood.is_some()
    }
}

/// A flat table of string cells, the unit persisted by the artifact store
///
/// Null cells are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Format an optional number as a table cell
pub fn format_cell(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_column_name(field.column_name()), Some(field));
        }
        assert_eq!(Field::from_column_name("unknown"), None);
    }

    #[test]
    fn test_field_serde_uses_column_names() {
        let json = serde_json::to_string(&Field::RestingHeartRate).unwrap();
        assert_eq!(json, "\"resting_heart_rate__value\"");
        let parsed: Field = serde_json::from_str("\"sleepissue_num\"").unwrap();
        assert_eq!(parsed, Field::SleepIssue);
    }

    #[test]
    fn test_master_table_rejects_duplicate_keys() {
        let records = vec![
            DailyRecord::empty(SubjectDay::new("S1", 1)),
            DailyRecord::empty(SubjectDay::new("S2", 1)),
            DailyRecord::empty(SubjectDay::new("S1", 1)),
        ];
        let err = MasterTable::new(records, BTreeSet::new()).unwrap_err();
        match err {
            PipelineError::DuplicateKey {
                subject_id,
                day_in_study,
                ..
            } => {
                assert_eq!(subject_id, "S1");
                assert_eq!(day_in_study, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_master_table_sorts_by_key() {
        let records = vec![
            DailyRecord::empty(SubjectDay::new("S2", 1)),
            DailyRecord::empty(SubjectDay::new("S1", 3)),
            DailyRecord::empty(SubjectDay::new("S1", 2)),
        ];
        let table = MasterTable::new(records, BTreeSet::new()).unwrap();
        let keys: Vec<_> = table.records().iter().map(|r| r.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                SubjectDay::new("S1", 2),
                SubjectDay::new("S1", 3),
                SubjectDay::new("S2", 1)
            ]
        );
        assert_eq!(table.subject_count(), 2);
    }

    #[test]
    fn test_set_numeric_ignores_non_numeric_fields() {
        let mut record = DailyRecord::empty(SubjectDay::new("S1", 1));
        record.set_numeric(Field::Phase, Some(1.0));
        record.set_numeric(Field::Stress, Some(3.0));
        assert_eq!(record.numeric(Field::Stress), Some(3.0));
        assert_eq!(record.phase, None);
    }
}
