//! Artifact persistence
//!
//! Layout of a [`FileArtifactStore`] rooted at `root`:
//!
//! ```text
//! root/master/<feature_group>.csv
//! root/datasets/<name>/data.csv
//! root/datasets/<name>/manifest.json
//! root/models/<name>/v<N>/{feature_columns.json, metrics.json, model.json}
//! ```
//!
//! Nothing is ever visible half-written. Files and dataset directories are
//! staged next to their destination and moved into place with a rename; a
//! model version only exists once its staged directory has been renamed to
//! `v<N>`, so a failed write never advances the visible version.

use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

use crate::dataset::DatasetManifest;
use crate::error::PipelineError;
use crate::model::ModelBundle;
use crate::types::Table;

const MASTER_DIR: &str = "master";
const DATASETS_DIR: &str = "datasets";
const MODELS_DIR: &str = "models";
const DATA_FILE: &str = "data.csv";
const MANIFEST_FILE: &str = "manifest.json";
const FEATURE_COLUMNS_FILE: &str = "feature_columns.json";
const METRICS_FILE: &str = "metrics.json";
const MODEL_FILE: &str = "model.json";

/// Durable store for pipeline outputs
pub trait ArtifactStore {
    /// Replace the master table
    fn write_master_table(&self, name: &str, table: &Table) -> Result<(), PipelineError>;

    fn read_master_table(&self, name: &str) -> Result<Table, PipelineError>;

    /// Replace a dataset and its manifest as one unit
    fn write_dataset(&self, table: &Table, manifest: &DatasetManifest) -> Result<(), PipelineError>;

    fn read_dataset(&self, name: &str) -> Result<(Table, DatasetManifest), PipelineError>;

    /// Register a new model version and return its number
    fn register_model(&self, bundle: &ModelBundle) -> Result<u32, PipelineError>;

    /// Load a model version, or the latest one
    fn load_model(&self, name: &str, version: Option<u32>) -> Result<ModelBundle, PipelineError>;

    /// Registered versions of a model, ascending
    fn model_versions(&self, name: &str) -> Result<Vec<u32>, PipelineError>;
}

/// Artifact store on the local filesystem
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
    max_retries: u32,
    retry_delay: Duration,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_table_path(&self, name: &str) -> PathBuf {
        self.root.join(MASTER_DIR).join(format!("{name}.csv"))
    }

    pub fn dataset_dir(&self, name: &str) -> PathBuf {
        self.root.join(DATASETS_DIR).join(name)
    }

    pub fn model_dir(&self, name: &str, version: u32) -> PathBuf {
        self.root.join(MODELS_DIR).join(name).join(format!("v{version}"))
    }

    /// Names of every registered model, sorted
    pub fn model_names(&self) -> Result<Vec<String>, PipelineError> {
        let dir = self.root.join(MODELS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete all but the newest `keep` versions of each model
    ///
    /// Returns the version directories removed (or that would be, on a dry run).
    pub fn prune_models(&self, keep: usize, dry_run: bool) -> Result<Vec<PathBuf>, PipelineError> {
        let mut removed = Vec::new();
        for name in self.model_names()? {
            let versions = self.model_versions(&name)?;
            let excess = versions.len().saturating_sub(keep);
            for version in &versions[..excess] {
                let dir = self.model_dir(&name, *version);
                info!("{} model {} v{}", if dry_run { "Would delete" } else { "Deleting" }, name, version);
                if !dry_run {
                    fs::remove_dir_all(&dir)?;
                }
                removed.push(dir);
            }
        }
        Ok(removed)
    }

    /// Run a write, retrying transient failures with linear backoff
    fn with_retry<T, F>(&self, artifact: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Result<T, PipelineError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!("{artifact}: {e}; retry {attempt}/{}", self.max_retries);
                    thread::sleep(self.retry_delay * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl ArtifactStore for FileArtifactStore {
    fn write_master_table(&self, name: &str, table: &Table) -> Result<(), PipelineError> {
        let path = self.master_table_path(name);
        let bytes = table_to_csv(table, name)?;
        self.with_retry(name, || write_file_atomic(&path, &bytes, name))?;
        info!("Wrote master table {} ({} rows)", path.display(), table.rows.len());
        Ok(())
    }

    fn read_master_table(&self, name: &str) -> Result<Table, PipelineError> {
        read_csv(&self.master_table_path(name))
    }

    fn write_dataset(&self, table: &Table, manifest: &DatasetManifest) -> Result<(), PipelineError> {
        let name = manifest.name.as_str();
        let data = table_to_csv(table, name)?;
        let manifest_json = serde_json::to_vec_pretty(manifest)?;
        let target = self.dataset_dir(name);

        self.with_retry(name, || {
            let staging = staging_path(&target);
            let written = write_dir_contents(
                &staging,
                &[(DATA_FILE, &data), (MANIFEST_FILE, &manifest_json)],
            )
            .and_then(|()| swap_dir(&staging, &target));
            if written.is_err() {
                let _ = fs::remove_dir_all(&staging);
            }
            written.map_err(|e| write_failure(name, e))
        })?;
        info!("Wrote dataset {} ({} rows)", target.display(), table.rows.len());
        Ok(())
    }

    fn read_dataset(&self, name: &str) -> Result<(Table, DatasetManifest), PipelineError> {
        let dir = self.dataset_dir(name);
        let table = read_csv(&dir.join(DATA_FILE))?;
        let manifest: DatasetManifest =
            serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST_FILE))?)?;
        Ok((table, manifest))
    }

    fn register_model(&self, bundle: &ModelBundle) -> Result<u32, PipelineError> {
        let name = bundle.name.as_str();
        let feature_columns = serde_json::to_vec_pretty(&bundle.feature_columns)?;
        let metrics = serde_json::to_vec_pretty(&bundle.metrics)?;
        let model = serde_json::to_vec_pretty(bundle)?;

        let version = self.with_retry(name, || {
            let version = self.model_versions(name)?.last().copied().unwrap_or(0) + 1;
            let target = self.model_dir(name, version);
            let staging = staging_path(&target);
            let written = write_dir_contents(
                &staging,
                &[
                    (FEATURE_COLUMNS_FILE, &feature_columns),
                    (METRICS_FILE, &metrics),
                    (MODEL_FILE, &model),
                ],
            )
            .and_then(|()| fs::rename(&staging, &target));
            if written.is_err() {
                let _ = fs::remove_dir_all(&staging);
            }
            written.map_err(|e| write_failure(name, e))?;
            Ok(version)
        })?;
        info!("Registered model {} v{}", name, version);
        Ok(version)
    }

    fn load_model(&self, name: &str, version: Option<u32>) -> Result<ModelBundle, PipelineError> {
        let version = match version {
            Some(v) => v,
            None => self.model_versions(name)?.last().copied().ok_or_else(|| {
                PipelineError::Config(format!("no registered versions of model '{name}'"))
            })?,
        };
        let dir = self.model_dir(name, version);
        let bundle: ModelBundle = serde_json::from_str(&fs::read_to_string(dir.join(MODEL_FILE))?)?;

        let columns: Vec<String> =
            serde_json::from_str(&fs::read_to_string(dir.join(FEATURE_COLUMNS_FILE))?)?;
        if columns != bundle.feature_columns {
            return Err(PipelineError::ColumnMismatch {
                model: format!("{name} v{version}"),
                expected: columns,
                actual: bundle.feature_columns,
            });
        }
        debug!("Loaded model {} v{}", name, version);
        Ok(bundle)
    }

    fn model_versions(&self, name: &str) -> Result<Vec<u32>, PipelineError> {
        let dir = self.root.join(MODELS_DIR).join(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(v) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u32>().ok())
            {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn write_failure(artifact: &str, err: io::Error) -> PipelineError {
    PipelineError::WriteFailure {
        artifact: artifact.to_string(),
        transient: is_transient(&err),
        message: err.to_string(),
    }
}

/// Hidden sibling path used while a write is in progress
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.staging", Uuid::new_v4()))
}

fn write_file_atomic(path: &Path, bytes: &[u8], artifact: &str) -> Result<(), PipelineError> {
    let staging = staging_path(path);
    let result = (|| -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&staging, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result.map_err(|e| write_failure(artifact, e))
}

fn write_dir_contents(dir: &Path, files: &[(&str, &Vec<u8>)]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    for (name, bytes) in files {
        let mut file = File::create(dir.join(name))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Move `staging` to `target`, replacing any previous directory there
///
/// Once the new directory is in place the write has succeeded; failing to
/// delete the retired copy only leaves a hidden `.old` directory behind.
fn swap_dir(staging: &Path, target: &Path) -> io::Result<()> {
    swap_dir_with(staging, target, |from, to| fs::rename(from, to), |dir| fs::remove_dir_all(dir))
}

fn swap_dir_with<R, D>(staging: &Path, target: &Path, rename: R, remove_dir: D) -> io::Result<()>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
    D: Fn(&Path) -> io::Result<()>,
{
    if !target.exists() {
        return rename(staging, target);
    }
    let retired = target.with_file_name(format!(
        ".{}.{}.old",
        target.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        Uuid::new_v4()
    ));
    rename(target, &retired)?;
    if let Err(e) = rename(staging, target) {
        rename(&retired, target)?;
        return Err(e);
    }
    if let Err(e) = remove_dir(&retired) {
        warn!("Could not remove retired {}: {e}", retired.display());
    }
    Ok(())
}

fn table_to_csv(table: &Table, artifact: &str) -> Result<Vec<u8>, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|e| PipelineError::WriteFailure {
        artifact: artifact.to_string(),
        message: e.to_string(),
        transient: false,
    })
}

fn read_csv(path: &Path) -> Result<Table, PipelineError> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns = reader.headers()?.iter().map(str::to_string).collect();
    let mut table = Table::new(columns);
    for record in reader.records() {
        table.rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EvaluationMetrics;
    use crate::split::SubjectSplit;
    use crate::types::{Mode, Target};
    use chrono::Utc;

    fn table() -> Table {
        Table {
            columns: vec!["subject_id".into(), "day_in_study".into(), "stress_num".into()],
            rows: vec![
                vec!["S1".into(), "1".into(), "2".into()],
                vec!["S1".into(), "2".into(), "".into()],
            ],
        }
    }

    fn manifest(name: &str, rows: usize) -> DatasetManifest {
        DatasetManifest {
            name: name.to_string(),
            target: Target::Energy,
            mode: Mode::A,
            feature_columns: vec!["stress_num".into()],
            label_column: "y_energy_cls3".into(),
            label_schema_version: "cls3.v1".into(),
            row_count: rows,
            class_counts: [1, 0, 1],
            split: SubjectSplit::new(["S1", "S2"], 0.5, 42).unwrap(),
            run_id: "test".into(),
            created_at: Utc::now(),
        }
    }

    fn bundle() -> ModelBundle {
        ModelBundle {
            name: "mcphases_energy_modea_majority".into(),
            target: Target::Energy,
            mode: Mode::A,
            feature_columns: vec!["stress_num".into()],
            n_train: 10,
            n_test: 4,
            metrics: Some(EvaluationMetrics {
                accuracy: 0.5,
                balanced_accuracy: 0.5,
                macro_f1: 0.4,
                majority_baseline_accuracy: 0.5,
                majority_class: 1,
                n_train: 10,
                n_test: 4,
            }),
            model_kind: "majority_class".into(),
            model: serde_json::json!({ "class": 1, "class_counts": [2, 6, 2] }),
        }
    }

    #[test]
    fn test_master_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());

        store.write_master_table("mcphases_daily_fg", &table()).unwrap();
        assert_eq!(store.read_master_table("mcphases_daily_fg").unwrap(), table());
    }

    #[test]
    fn test_dataset_overwrite_replaces_whole_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());

        store.write_dataset(&table(), &manifest("ds", 2)).unwrap();
        let mut smaller = table();
        smaller.rows.truncate(1);
        store.write_dataset(&smaller, &manifest("ds", 1)).unwrap();

        let (read, read_manifest) = store.read_dataset("ds").unwrap();
        assert_eq!(read, smaller);
        assert_eq!(read_manifest.row_count, 1);

        // no staging or retired directories left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path().join(DATASETS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["ds".to_string()]);
    }

    fn dir_with(parent: &Path, name: &str, contents: &str) -> PathBuf {
        let dir = parent.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DATA_FILE), contents).unwrap();
        dir
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_swap_rolls_back_when_new_directory_cannot_move_in() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir_with(dir.path(), "ds", "old");
        let staging = dir_with(dir.path(), ".ds.staging", "new");

        let result = swap_dir_with(
            &staging,
            &target,
            |from, to| {
                if from == staging.as_path() {
                    Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
                } else {
                    fs::rename(from, to)
                }
            },
            |d| fs::remove_dir_all(d),
        );

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(target.join(DATA_FILE)).unwrap(), "old");
        assert_eq!(entries(dir.path()), vec![".ds.staging".to_string(), "ds".to_string()]);
    }

    #[test]
    fn test_swap_succeeds_when_retired_directory_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir_with(dir.path(), "ds", "old");
        let staging = dir_with(dir.path(), ".ds.staging", "new");

        swap_dir_with(
            &staging,
            &target,
            |from, to| fs::rename(from, to),
            |_| Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
        )
        .unwrap();

        assert_eq!(fs::read_to_string(target.join(DATA_FILE)).unwrap(), "new");
        assert!(!staging.exists());
    }

    #[test]
    fn test_model_versions_advance() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());

        assert_eq!(store.register_model(&bundle()).unwrap(), 1);
        assert_eq!(store.register_model(&bundle()).unwrap(), 2);
        assert_eq!(store.model_versions(&bundle().name).unwrap(), vec![1, 2]);

        let loaded = store.load_model(&bundle().name, None).unwrap();
        assert_eq!(loaded, bundle());
        assert!(store
            .model_dir(&bundle().name, 2)
            .join(FEATURE_COLUMNS_FILE)
            .exists());
    }

    #[test]
    fn test_failed_write_does_not_advance_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        store.register_model(&bundle()).unwrap();

        // a file where the model directory should be makes the rename fail
        let blocked = store.model_dir(&bundle().name, 2);
        fs::write(&blocked, b"not a directory").unwrap();

        assert!(store.register_model(&bundle()).is_err());
        fs::remove_file(&blocked).unwrap();
        assert_eq!(store.model_versions(&bundle().name).unwrap(), vec![1]);
    }

    #[test]
    fn test_load_detects_tampered_feature_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        store.register_model(&bundle()).unwrap();

        let path = store.model_dir(&bundle().name, 1).join(FEATURE_COLUMNS_FILE);
        fs::write(&path, br#"["cramps_num"]"#).unwrap();

        let err = store.load_model(&bundle().name, Some(1)).unwrap_err();
        assert!(matches!(err, PipelineError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_prune_keeps_newest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        for _ in 0..4 {
            store.register_model(&bundle()).unwrap();
        }

        let planned = store.prune_models(1, true).unwrap();
        assert_eq!(planned.len(), 3);
        assert_eq!(store.model_versions(&bundle().name).unwrap().len(), 4);

        store.prune_models(1, false).unwrap();
        assert_eq!(store.model_versions(&bundle().name).unwrap(), vec![4]);
    }

    #[test]
    fn test_retry_gives_up_on_permanent_failures() {
        let store = FileArtifactStore::new("unused").with_retries(3, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<(), PipelineError> = store.with_retry("x", || {
            calls += 1;
            Err(write_failure("x", io::Error::new(io::ErrorKind::PermissionDenied, "denied")))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let store = FileArtifactStore::new("unused").with_retries(3, Duration::from_millis(1));
        let mut calls = 0;
        let result = store.with_retry("x", || {
            calls += 1;
            if calls < 3 {
                Err(write_failure("x", io::Error::new(io::ErrorKind::TimedOut, "slow")))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
