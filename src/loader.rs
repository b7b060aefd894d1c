//! Master table loading
//!
//! Reads the raw per-source CSV extracts, normalizes their keys, collapses
//! same-day samples and merges everything into one row per
//! `(subject_id, day_in_study)`.
//!
//! Collapse rules:
//! - numeric and ordinal fields: mean of all same-day samples, pooled across
//!   every source that maps the field
//! - categorical fields: most frequent value, ties go to the first seen
//! - timestamps: first parseable value

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Weekday};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use crate::config::{PipelineConfig, SourceSpec};
use crate::error::PipelineError;
use crate::types::{
    format_cell, DailyRecord, Field, FieldKind, MasterTable, SubjectDay, Table,
};

/// Upper end of the self-report ordinal scale
pub const ORDINAL_MAX: f64 = 5.0;

const SUBJECT_COLUMN: &str = "subject_id";
const DAY_COLUMN: &str = "day_in_study";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Loader for building the master table from raw extracts
pub struct MasterTableLoader;

impl MasterTableLoader {
    /// Load every configured source from the data directory
    pub fn load(config: &PipelineConfig) -> Result<MasterTable, PipelineError> {
        Self::load_sources(&config.data_path, &config.sources)
    }

    /// Load and merge the given sources from `data_dir`
    pub fn load_sources(
        data_dir: &Path,
        sources: &[SourceSpec],
    ) -> Result<MasterTable, PipelineError> {
        let mut days: BTreeMap<SubjectDay, DayAccumulator> = BTreeMap::new();
        let mut columns = BTreeSet::new();

        for source in sources {
            let path = data_dir.join(&source.file);
            let reader = csv::Reader::from_path(&path).map_err(|e| {
                PipelineError::schema(&source.file, format!("cannot open {}: {e}", path.display()))
            })?;
            let rows = read_source(reader, source, &mut days)?;
            info!("Loaded {} rows from {}", rows, source.file);
            columns.extend(source.columns.iter().map(|c| c.field));
        }

        finish(days, columns)
    }

    /// Load sources from in-memory CSV text, keyed by source file name
    pub fn load_from_readers<R: io::Read>(
        inputs: Vec<(SourceSpec, R)>,
    ) -> Result<MasterTable, PipelineError> {
        let mut days: BTreeMap<SubjectDay, DayAccumulator> = BTreeMap::new();
        let mut columns = BTreeSet::new();

        for (source, reader) in inputs {
            read_source(csv::Reader::from_reader(reader), &source, &mut days)?;
            columns.extend(source.columns.iter().map(|c| c.field));
        }

        finish(days, columns)
    }

    /// Check one extract's header and cells without building a table
    pub fn inspect_source(
        data_dir: &Path,
        source: &SourceSpec,
    ) -> Result<SourceSummary, PipelineError> {
        let path = data_dir.join(&source.file);
        let reader = csv::Reader::from_path(&path).map_err(|e| {
            PipelineError::schema(&source.file, format!("cannot open {}: {e}", path.display()))
        })?;
        let mut days = BTreeMap::new();
        let rows = read_source(reader, source, &mut days)?;
        let subjects: BTreeSet<&str> = days.keys().map(|k| k.subject_id.as_str()).collect();
        Ok(SourceSummary {
            file: source.file.clone(),
            rows,
            subjects: subjects.len(),
            subject_days: days.len(),
        })
    }
}

/// Shape of one raw extract, as reported by validation
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SourceSummary {
    pub file: String,
    pub rows: usize,
    pub subjects: usize,
    pub subject_days: usize,
}

/// Accumulator for collapsing all samples of one subject-day
#[derive(Debug, Default)]
struct DayAccumulator {
    sums: BTreeMap<Field, (f64, usize)>,
    /// Category counts in first-seen order
    categories: BTreeMap<Field, Vec<(String, usize)>>,
    timestamp: Option<NaiveDateTime>,
}

impl DayAccumulator {
    fn add_numeric(&mut self, field: Field, value: f64) {
        let entry = self.sums.entry(field).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    fn add_category(&mut self, field: Field, value: &str) {
        let counts = self.categories.entry(field).or_default();
        match counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value.to_string(), 1)),
        }
    }

    fn add_timestamp(&mut self, value: NaiveDateTime) {
        if self.timestamp.is_none() {
            self.timestamp = Some(value);
        }
    }

    fn mean(&self, field: Field) -> Option<f64> {
        self.sums
            .get(&field)
            .filter(|(_, n)| *n > 0)
            .map(|(sum, n)| sum / *n as f64)
    }

    fn mode(&self, field: Field) -> Option<String> {
        let counts = self.categories.get(&field)?;
        let mut best: Option<&(String, usize)> = None;
        for entry in counts {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(value, _)| value.clone())
    }

    fn into_record(self, key: SubjectDay) -> DailyRecord {
        let mut record = DailyRecord::empty(key);
        for field in Field::ALL {
            match field.kind() {
                FieldKind::Numeric | FieldKind::Ordinal => {
                    record.set_numeric(field, self.mean(field))
                }
                FieldKind::Categorical => record.phase = self.mode(field),
                FieldKind::Timestamp => record.event_timestamp = self.timestamp,
            }
        }
        if record.is_weekend.is_none() {
            record.is_weekend = record.event_timestamp.map(|ts| weekend_flag(ts.date()));
        }
        record
    }
}

fn finish(
    days: BTreeMap<SubjectDay, DayAccumulator>,
    mut columns: BTreeSet<Field>,
) -> Result<MasterTable, PipelineError> {
    if columns.contains(&Field::EventTimestamp) {
        columns.insert(Field::IsWeekend);
    }
    let records: Vec<DailyRecord> = days
        .into_iter()
        .map(|(key, acc)| acc.into_record(key))
        .collect();
    let table = MasterTable::new(records, columns)?;
    info!(
        "Master table: {} rows across {} subjects",
        table.len(),
        table.subject_count()
    );
    Ok(table)
}

/// Read one extract into the accumulators, returning the number of data rows
fn read_source<R: io::Read>(
    mut rdr: csv::Reader<R>,
    source: &SourceSpec,
    days: &mut BTreeMap<SubjectDay, DayAccumulator>,
) -> Result<usize, PipelineError> {
    let headers = rdr.headers()?.clone();

    let col = |name: &str| -> Result<usize, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| PipelineError::schema(&source.file, format!("missing column '{name}'")))
    };

    let i_subject = col(&source.subject_column)?;
    let i_day = col(&source.day_column)?;
    let mapped = source
        .columns
        .iter()
        .map(|m| Ok((col(&m.source)?, m)))
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let mut rows = 0;
    let mut clamped = 0;
    let mut bad_timestamps = 0;

    for (row_idx, result) in rdr.records().enumerate() {
        let record = result?;
        let row = row_idx + 1;
        let cell = |i: usize| record.get(i).unwrap_or("");

        let key = parse_key(
            cell(i_subject),
            cell(i_day),
            &source.file,
            row,
            &source.subject_column,
            &source.day_column,
        )?;
        let acc = days.entry(key).or_default();

        for (idx, mapping) in &mapped {
            let raw = cell(*idx);
            if is_null(raw) {
                continue;
            }
            match mapping.field.kind() {
                FieldKind::Numeric => {
                    let value = parse_number(raw).ok_or_else(|| parse_error(source, row, mapping.source.as_str(), raw))?;
                    acc.add_numeric(mapping.field, value * mapping.scale);
                }
                FieldKind::Ordinal => {
                    let value = parse_ordinal(raw).ok_or_else(|| parse_error(source, row, mapping.source.as_str(), raw))?
                        * mapping.scale;
                    let bounded = value.clamp(0.0, ORDINAL_MAX);
                    if bounded != value {
                        clamped += 1;
                    }
                    acc.add_numeric(mapping.field, bounded);
                }
                FieldKind::Categorical => acc.add_category(mapping.field, raw.trim()),
                FieldKind::Timestamp => match parse_timestamp(raw) {
                    Some(ts) => acc.add_timestamp(ts),
                    None => bad_timestamps += 1,
                },
            }
        }
        rows += 1;
    }

    if clamped > 0 {
        warn!("{}: clamped {} ordinal values into 0-{}", source.file, clamped, ORDINAL_MAX);
    }
    if bad_timestamps > 0 {
        warn!("{}: ignored {} unparseable timestamps", source.file, bad_timestamps);
    }
    debug!("{}: {} rows read", source.file, rows);
    Ok(rows)
}

fn parse_error(source: &SourceSpec, row: usize, column: &str, value: &str) -> PipelineError {
    PipelineError::Parse {
        source_name: source.file.clone(),
        row,
        column: column.to_string(),
        value: value.to_string(),
    }
}

fn parse_key(
    subject: &str,
    day: &str,
    source_name: &str,
    row: usize,
    subject_column: &str,
    day_column: &str,
) -> Result<SubjectDay, PipelineError> {
    let subject = subject.trim();
    if is_null(subject) {
        return Err(PipelineError::MissingKey {
            source_name: source_name.to_string(),
            row,
            column: subject_column.to_string(),
        });
    }
    if is_null(day) {
        return Err(PipelineError::MissingKey {
            source_name: source_name.to_string(),
            row,
            column: day_column.to_string(),
        });
    }
    let day_in_study = parse_day(day).ok_or_else(|| PipelineError::Parse {
        source_name: source_name.to_string(),
        row,
        column: day_column.to_string(),
        value: day.to_string(),
    })?;
    Ok(SubjectDay::new(subject, day_in_study))
}

/// Day indices sometimes arrive as floats ("3.0"); only integral values are accepted
fn parse_day(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>().ok().or_else(|| {
        let v = raw.parse::<f64>().ok()?;
        // beyond 2^53 a float no longer names a single integer
        (v.fract() == 0.0 && v.abs() <= 9_007_199_254_740_992.0).then_some(v as i64)
    })
}

pub(crate) fn is_null(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty()
        || ["nan", "na", "n/a", "null", "none"]
            .iter()
            .any(|token| raw.eq_ignore_ascii_case(token))
}

/// Parse a plain number; booleans map to 1/0
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        return Some(1.0);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Some(0.0);
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a self-report value given either as a number or as the text scale
pub(crate) fn parse_ordinal(raw: &str) -> Option<f64> {
    if let Some(v) = parse_number(raw) {
        return Some(v);
    }
    let text = raw.trim().to_ascii_lowercase();
    let level = match text.as_str() {
        "not at all" => 0.0,
        "very low/little" | "very low" | "very little" => 1.0,
        "low" => 2.0,
        "moderate" => 3.0,
        "high" => 4.0,
        "very high" => 5.0,
        _ => return None,
    };
    Some(level)
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_local());
    }
    for format in [TIMESTAMP_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn weekend_flag(date: NaiveDate) -> f64 {
    match date.weekday() {
        Weekday::Sat | Weekday::Sun => 1.0,
        _ => 0.0,
    }
}

impl MasterTable {
    /// Flatten into a string table for persistence
    pub fn to_table(&self) -> Table {
        let fields: Vec<Field> = Field::ALL
            .into_iter()
            .filter(|f| self.has_column(*f))
            .collect();

        let mut columns = vec![SUBJECT_COLUMN.to_string(), DAY_COLUMN.to_string()];
        columns.extend(fields.iter().map(|f| f.column_name().to_string()));
        let mut table = Table::new(columns);

        for record in self.records() {
            let mut row = vec![
                record.key.subject_id.clone(),
                record.key.day_in_study.to_string(),
            ];
            for field in &fields {
                row.push(match field.kind() {
                    FieldKind::Timestamp => record
                        .event_timestamp
                        .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
                        .unwrap_or_default(),
                    FieldKind::Categorical => record.phase.clone().unwrap_or_default(),
                    FieldKind::Numeric | FieldKind::Ordinal => format_cell(record.numeric(*field)),
                });
            }
            table.rows.push(row);
        }
        table
    }

    /// Rebuild a master table from its persisted form, re-checking key uniqueness
    pub fn from_table(table: &Table) -> Result<MasterTable, PipelineError> {
        const SOURCE: &str = "master table";
        let i_subject = table
            .column_index(SUBJECT_COLUMN)
            .ok_or_else(|| PipelineError::schema(SOURCE, format!("missing column '{SUBJECT_COLUMN}'")))?;
        let i_day = table
            .column_index(DAY_COLUMN)
            .ok_or_else(|| PipelineError::schema(SOURCE, format!("missing column '{DAY_COLUMN}'")))?;

        let mut fields = Vec::new();
        for (idx, name) in table.columns.iter().enumerate() {
            if idx == i_subject || idx == i_day {
                continue;
            }
            let field = Field::from_column_name(name).ok_or_else(|| {
                PipelineError::schema(SOURCE, format!("unexpected column '{name}'"))
            })?;
            fields.push((idx, field));
        }

        let mut records = Vec::with_capacity(table.rows.len());
        for (row_idx, row) in table.rows.iter().enumerate() {
            let row_num = row_idx + 1;
            let cell = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
            let key = parse_key(cell(i_subject), cell(i_day), SOURCE, row_num, SUBJECT_COLUMN, DAY_COLUMN)?;
            let mut record = DailyRecord::empty(key);

            for (idx, field) in &fields {
                let raw = cell(*idx);
                if is_null(raw) {
                    continue;
                }
                let bad_cell = || PipelineError::Parse {
                    source_name: SOURCE.to_string(),
                    row: row_num,
                    column: field.column_name().to_string(),
                    value: raw.to_string(),
                };
                match field.kind() {
                    FieldKind::Timestamp => {
                        record.event_timestamp = Some(parse_timestamp(raw).ok_or_else(bad_cell)?)
                    }
                    FieldKind::Categorical => record.phase = Some(raw.to_string()),
                    FieldKind::Numeric | FieldKind::Ordinal => {
                        record.set_numeric(*field, Some(parse_number(raw).ok_or_else(bad_cell)?))
                    }
                }
            }
            records.push(record);
        }

        MasterTable::new(records, fields.into_iter().map(|(_, f)| f).collect())
    }
}
