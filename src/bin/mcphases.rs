//! mcphases CLI - build and inspect the mcPHASES feature datasets
//!
//! Commands:
//! - backfill: Load raw extracts into the master table
//! - features: Build the four datasets from the master table
//! - run: backfill followed by features
//! - validate: Schema-check the raw extracts
//! - schema: Print the Mode A / Mode B feature columns
//! - baseline: Train and register majority-class baselines
//! - encode: Encode an inference request (optionally predict)
//! - prune: Delete superseded model versions
//! - doctor: Diagnose configuration and paths

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use mcphases_features::loader::SourceSummary;
use mcphases_features::pipeline::FeaturePipeline;
use mcphases_features::store::FileArtifactStore;
use mcphases_features::{
    ArtifactStore, FeatureSchema, InferenceRequest, MasterTableLoader, Mode, PipelineConfig,
    PipelineError, LABEL_SCHEMA_VERSION, PIPELINE_VERSION,
};

/// mcphases - leakage-safe feature datasets from mcPHASES extracts
#[derive(Parser)]
#[command(name = "mcphases")]
#[command(version = PIPELINE_VERSION)]
#[command(about = "Build energy and mood stability datasets from mcPHASES extracts", long_about = None)]
struct Cli {
    /// JSON configuration file (MCPHASES_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of raw CSV extracts
    #[arg(long, global = true)]
    data_path: Option<PathBuf>,

    /// Artifact store root
    #[arg(long, global = true)]
    output_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load raw extracts into the master table
    Backfill,

    /// Build the four datasets from the persisted master table
    Features {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Backfill, then build the datasets
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Schema-check the raw extracts without writing anything
    Validate {
        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the feature columns of each mode
    Schema {
        #[arg(value_enum, default_value = "both")]
        mode: SchemaMode,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Train and register majority-class baselines for every dataset
    Baseline {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Encode an inference request into aligned feature columns
    Encode {
        /// Request JSON file (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Also predict with the latest registered baselines
        #[arg(long)]
        predict: bool,
    },

    /// Delete superseded model versions
    Prune {
        /// Versions to keep per model
        #[arg(long, default_value = "3")]
        keep: usize,

        /// Only list what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Diagnose configuration and paths
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum SchemaMode {
    /// Allow-listed features only
    A,
    /// Mode A plus previous-day labels
    B,
    Both,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), McphasesCliError> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Backfill => cmd_backfill(config),
        Commands::Features { json } => cmd_features(config, json, false),
        Commands::Run { json } => cmd_features(config, json, true),
        Commands::Validate { json } => cmd_validate(&config, json),
        Commands::Schema { mode, json } => cmd_schema(&config, mode, json),
        Commands::Baseline { json } => cmd_baseline(config, json),
        Commands::Encode { input, predict } => cmd_encode(config, &input, predict),
        Commands::Prune { keep, dry_run } => cmd_prune(&config, keep, dry_run),
        Commands::Doctor { json } => cmd_doctor(&config, cli.config.as_deref(), json),
    }
}

/// File, then environment, then command-line flags; validation is left to each command
fn load_config(cli: &Cli) -> Result<PipelineConfig, McphasesCliError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json(&fs::read_to_string(path)?)?,
        None => PipelineConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    if let Some(path) = &cli.data_path {
        config.data_path = path.clone();
    }
    if let Some(path) = &cli.output_path {
        config.output_path = path.clone();
    }
    Ok(config)
}

fn cmd_backfill(config: PipelineConfig) -> Result<(), McphasesCliError> {
    config.validate()?;
    let pipeline = FeaturePipeline::from_config(config);
    let master = pipeline.backfill()?;
    println!(
        "Master table '{}': {} rows, {} subjects",
        pipeline.config().feature_group_name,
        master.len(),
        master.subject_count()
    );
    Ok(())
}

fn cmd_features(config: PipelineConfig, json: bool, backfill: bool) -> Result<(), McphasesCliError> {
    config.validate()?;
    let pipeline = FeaturePipeline::from_config(config);
    let report = if backfill { pipeline.run()? } else { pipeline.features()? };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Run {}", report.run_id);
        println!("Master rows: {}  Subjects: {}", report.master_rows, report.subjects);
        println!(
            "Split: {} train / {} test subjects",
            report.train_subjects.len(),
            report.test_subjects.len()
        );
        println!();
        for dataset in &report.datasets {
            println!(
                "  {:<24} {:>6} rows  {:>2} features  classes {:?}",
                dataset.name,
                dataset.rows,
                dataset.feature_columns.len(),
                dataset.class_counts
            );
        }
    }
    Ok(())
}

fn cmd_validate(config: &PipelineConfig, json: bool) -> Result<(), McphasesCliError> {
    config.validate()?;

    let mut sources = Vec::new();
    let mut errors = Vec::new();
    for source in &config.sources {
        match MasterTableLoader::inspect_source(&config.data_path, source) {
            Ok(summary) => sources.push(summary),
            Err(e) => errors.push(SourceError {
                file: source.file.clone(),
                error: e.to_string(),
            }),
        }
    }

    let report = ValidationReport {
        total_sources: config.sources.len(),
        valid_sources: sources.len(),
        invalid_sources: errors.len(),
        sources,
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total sources:   {}", report.total_sources);
        println!("Valid sources:   {}", report.valid_sources);
        println!("Invalid sources: {}", report.invalid_sources);

        if !report.sources.is_empty() {
            println!("\nSources:");
            for s in &report.sources {
                println!(
                    "  - {}: {} rows, {} subjects, {} subject-days",
                    s.file, s.rows, s.subjects, s.subject_days
                );
            }
        }
        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - {}: {}", err.file, err.error);
            }
        }
    }

    if report.invalid_sources > 0 {
        Err(McphasesCliError::ValidationFailed(report.invalid_sources))
    } else {
        Ok(())
    }
}

fn cmd_schema(config: &PipelineConfig, mode: SchemaMode, json: bool) -> Result<(), McphasesCliError> {
    let pipeline = FeaturePipeline::from_config(config.clone());
    let mode_a = pipeline.mode_a_schema()?;
    let schemas: Vec<FeatureSchema> = match mode {
        SchemaMode::A => vec![mode_a],
        SchemaMode::B => vec![mode_a.to_mode_b()],
        SchemaMode::Both => {
            let mode_b = mode_a.to_mode_b();
            vec![mode_a, mode_b]
        }
    };

    if json {
        let value: serde_json::Map<String, serde_json::Value> = schemas
            .iter()
            .map(|s| (mode_name(s.mode).to_string(), serde_json::json!(s.column_names())))
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for schema in &schemas {
            println!("{} ({} columns):", mode_name(schema.mode), schema.len());
            for name in schema.column_names() {
                println!("  - {}", name);
            }
        }
    }
    Ok(())
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::A => "mode_a",
        Mode::B => "mode_b",
    }
}

fn cmd_baseline(config: PipelineConfig, json: bool) -> Result<(), McphasesCliError> {
    let pipeline = FeaturePipeline::from_config(config);
    let registered = pipeline.register_baselines()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&registered)?);
    } else {
        for model in &registered {
            match &model.metrics {
                Some(m) => println!(
                    "  {:<33} v{:<3} acc {:.3}  bal_acc {:.3}  macro_f1 {:.3}  baseline {:.3}",
                    model.name, model.version, m.accuracy, m.balanced_accuracy, m.macro_f1, m.majority_baseline_accuracy
                ),
                None => println!(
                    "  {:<33} v{:<3} unscored ({} train rows, no test rows)",
                    model.name, model.version, model.n_train
                ),
            }
        }
    }
    Ok(())
}

fn cmd_encode(config: PipelineConfig, input: &Path, predict: bool) -> Result<(), McphasesCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };
    let request: InferenceRequest = serde_json::from_str(&input_data)?;
    let pipeline = FeaturePipeline::from_config(config);

    if predict {
        let prediction = pipeline.predictor()?.predict(&request)?;
        println!("{}", serde_json::to_string_pretty(&prediction)?);
    } else {
        let encoded = request.encode(&pipeline.mode_a_schema()?);
        println!("{}", serde_json::to_string_pretty(&encoded)?);
    }
    Ok(())
}

fn cmd_prune(config: &PipelineConfig, keep: usize, dry_run: bool) -> Result<(), McphasesCliError> {
    let store = FileArtifactStore::new(&config.output_path);
    let removed = store.prune_models(keep, dry_run)?;

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    println!("{} {} model version(s)", verb, removed.len());
    for path in &removed {
        println!("  - {}", path.display());
    }
    Ok(())
}

fn cmd_doctor(
    config: &PipelineConfig,
    config_file: Option<&Path>,
    json: bool,
) -> Result<(), McphasesCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck::ok("version", format!("mcphases version {}", PIPELINE_VERSION)));
    checks.push(DoctorCheck::ok("label_schema", format!("Label schema: {}", LABEL_SCHEMA_VERSION)));

    if let Some(path) = config_file {
        checks.push(DoctorCheck::ok("config_file", format!("Loaded {}", path.display())));
    }

    match config.validate() {
        Ok(()) => checks.push(DoctorCheck::ok("config", "Configuration valid".to_string())),
        Err(e) => checks.push(DoctorCheck::error("config", e.to_string())),
    }

    if config.data_path.is_dir() {
        for source in &config.sources {
            let path = config.data_path.join(&source.file);
            checks.push(if path.is_file() {
                DoctorCheck::ok("source", format!("{} present", source.file))
            } else {
                DoctorCheck::error("source", format!("{} missing from {}", source.file, config.data_path.display()))
            });
        }
    } else {
        checks.push(DoctorCheck::error(
            "data_path",
            format!("Data directory {} does not exist", config.data_path.display()),
        ));
    }

    let pipeline = FeaturePipeline::from_config(config.clone());
    match pipeline.mode_a_schema() {
        Ok(schema) => checks.push(DoctorCheck::ok(
            "features",
            format!("{} Mode-A columns, {} Mode-B columns", schema.len(), schema.to_mode_b().len()),
        )),
        Err(e) => checks.push(DoctorCheck::error("features", e.to_string())),
    }

    let store = pipeline.store();
    let master_path = store.master_table_path(&config.feature_group_name);
    checks.push(if master_path.is_file() {
        DoctorCheck::ok("master_table", format!("{} present", master_path.display()))
    } else {
        DoctorCheck::warning("master_table", "No master table yet (run 'mcphases backfill')".to_string())
    });

    match store.model_names() {
        Ok(names) if names.is_empty() => {
            checks.push(DoctorCheck::warning("models", "No registered models".to_string()))
        }
        Ok(names) => {
            let versions: usize = names
                .iter()
                .map(|n| store.model_versions(n).map(|v| v.len()).unwrap_or(0))
                .sum();
            checks.push(DoctorCheck::ok(
                "models",
                format!("{} models, {} versions", names.len(), versions),
            ))
        }
        Err(e) => checks.push(DoctorCheck::error("models", e.to_string())),
    }

    // encode reads requests from stdin by default
    checks.push(if atty::is(atty::Stream::Stdin) {
        DoctorCheck::ok("stdin", "stdin is a TTY (pass --input to encode)".to_string())
    } else {
        DoctorCheck::ok("stdin", "stdin is a pipe (encode ready)".to_string())
    });

    let report = DoctorReport {
        version: PIPELINE_VERSION.to_string(),
        data_path: config.data_path.display().to_string(),
        output_path: config.output_path.display().to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("mcphases Doctor Report");
        println!("======================");
        println!("Version:     {}", report.version);
        println!("Data path:   {}", report.data_path);
        println!("Output path: {}", report.output_path);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(McphasesCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum McphasesCliError {
    Io(io::Error),
    Pipeline(PipelineError),
    Json(serde_json::Error),
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for McphasesCliError {
    fn from(e: io::Error) -> Self {
        McphasesCliError::Io(e)
    }
}

impl From<PipelineError> for McphasesCliError {
    fn from(e: PipelineError) -> Self {
        McphasesCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for McphasesCliError {
    fn from(e: serde_json::Error) -> Self {
        McphasesCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(code: &str, message: String, hint: &str) -> Self {
        CliError {
            code: code.to_string(),
            message,
            hint: Some(hint.to_string()),
        }
    }
}

impl From<McphasesCliError> for CliError {
    fn from(e: McphasesCliError) -> Self {
        match e {
            McphasesCliError::Io(e) => CliError::new("IO_ERROR", e.to_string(), "Check file paths and permissions"),
            McphasesCliError::Json(e) => CliError::new("JSON_ERROR", e.to_string(), "Check JSON syntax"),
            McphasesCliError::Pipeline(e) => pipeline_error(e),
            McphasesCliError::ValidationFailed(count) => CliError::new(
                "VALIDATION_FAILED",
                format!("{} source(s) failed validation", count),
                "Fix the listed extracts and retry",
            ),
            McphasesCliError::DoctorFailed => CliError::new(
                "DOCTOR_FAILED",
                "One or more health checks failed".to_string(),
                "Review the doctor report for details",
            ),
        }
    }
}

fn pipeline_error(e: PipelineError) -> CliError {
    let message = e.to_string();
    let (code, hint) = match e {
        PipelineError::Schema { .. } => ("SCHEMA_ERROR", "Run 'mcphases validate' to check the extracts"),
        PipelineError::DuplicateKey { .. } => ("DUPLICATE_KEY", "The master table may be corrupt; rerun 'mcphases backfill'"),
        PipelineError::UnknownFeature(_) => ("UNKNOWN_FEATURE", "Run 'mcphases schema' and check feasible_features"),
        PipelineError::LeakageInvariant(_) => ("LEAKAGE_INVARIANT", "Remove label sources from feasible_features"),
        PipelineError::WriteFailure { transient: true, .. } => ("WRITE_FAILURE", "Transient store error; retry the command"),
        PipelineError::WriteFailure { .. } => ("WRITE_FAILURE", "Check output_path permissions and free space"),
        PipelineError::MissingKey { .. } => ("MISSING_KEY", "Every row needs a subject id and a day index"),
        PipelineError::Parse { .. } => ("PARSE_ERROR", "Fix the cell or map the column differently"),
        PipelineError::ColumnMismatch { .. } => ("COLUMN_MISMATCH", "Rebuild features and re-register the model"),
        PipelineError::Evaluation(_) => ("EVALUATION_ERROR", "Check that both split partitions have labeled rows"),
        PipelineError::Config(_) => ("CONFIG_ERROR", "Check the config file and MCPHASES_* variables"),
        PipelineError::Io(_) => ("IO_ERROR", "Check file paths and permissions"),
        PipelineError::Csv(_) => ("CSV_ERROR", "Check the CSV files are well formed"),
        PipelineError::Json(_) => ("JSON_ERROR", "Check JSON syntax"),
    };
    CliError::new(code, message, hint)
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_sources: usize,
    valid_sources: usize,
    invalid_sources: usize,
    sources: Vec<SourceSummary>,
    errors: Vec<SourceError>,
}

#[derive(serde::Serialize)]
struct SourceError {
    file: String,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    version: String,
    data_path: String,
    output_path: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

impl DoctorCheck {
    fn ok(name: &str, message: String) -> Self {
        Self { name: name.to_string(), status: CheckStatus::Ok, message }
    }

    fn warning(name: &str, message: String) -> Self {
        Self { name: name.to_string(), status: CheckStatus::Warning, message }
    }

    fn error(name: &str, message: String) -> Self {
        Self { name: name.to_string(), status: CheckStatus::Error, message }
    }
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
