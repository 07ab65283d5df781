use anyhow::{bail, Context, Result};
use building_change::{
    open_audit_store, read_verdicts_csv, record_merge_started, record_provenance,
    record_run_finished, record_run_started, record_verdicts, write_changed_list, write_provenance_csv,
    write_verdicts_csv, CityModel, Config, DetectionOutcome, DetectionPipeline,
    DirectoryRasterSource, MergedCityModel, ProvenanceTag, RasterPairLoader, Verdicts,
};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const VERDICTS_FILE: &str = "verdicts.csv";
const CHANGED_FILE: &str = "changed.txt";
const MERGED_FILE: &str = "merged.city.json";
const PROVENANCE_FILE: &str = "provenance.csv";

#[derive(Parser, Debug)]
#[command(name = "building-change")]
#[command(about = "Per-building change detection on height rasters + merge of two CityJSON epochs", long_about = None)]
#[command(version)]
struct Cli {
    /// Run configuration (TOML)
    #[arg(short, long, env = "BUILDING_CHANGE_CONFIG", default_value = "building-change.toml")]
    config: PathBuf,

    /// Output directory (overrides [paths].output_dir)
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// SQLite audit log (overrides [paths].audit_db)
    #[arg(long, global = true)]
    audit_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare both epochs' rasters and write the verdict table
    Detect(DetectArgs),

    /// Merge two city models using an existing verdict table
    Merge(MergeArgs),

    /// Detect, then merge
    Run {
        #[command(flatten)]
        detect: DetectArgs,

        #[command(flatten)]
        models: ModelArgs,
    },
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Epoch A raster directory
    #[arg(long)]
    rasters_a: Option<PathBuf>,

    /// Epoch B raster directory
    #[arg(long)]
    rasters_b: Option<PathBuf>,

    /// Detection threads (overrides [detection].workers)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Epoch A CityJSON file
    #[arg(long)]
    model_a: Option<PathBuf>,

    /// Epoch B CityJSON file
    #[arg(long)]
    model_b: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Verdict table written by `detect`
    #[arg(long)]
    verdicts: PathBuf,

    #[command(flatten)]
    models: ModelArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "building_change=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(dir) = cli.output_dir {
        config.paths.output_dir = Some(dir);
    }
    if let Some(db) = cli.audit_db {
        config.paths.audit_db = Some(db);
    }

    let output_dir = config.paths.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let audit = match &config.paths.audit_db {
        Some(path) => Some(open_audit_store(path)?),
        None => None,
    };
    let run_id = building_change::new_run_id();

    // Ctrl-C stops scheduling new buildings; finished verdicts are still written
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        warn!("Interrupt received, finishing in-flight buildings...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    match cli.command {
        Command::Detect(args) => {
            apply_detect_args(&mut config, &args)?;
            let classifier = config.classifier()?;
            if let Some(conn) = &audit {
                record_run_started(conn, &run_id, "detect", classifier.snapshot())?;
            }

            let outcome = run_detection(&config, &output_dir, audit.as_ref(), &run_id, &cancel)?;
            finish_run(audit.as_ref(), &run_id, &outcome, None)?;
        }
        Command::Merge(args) => {
            apply_model_args(&mut config, &args.models);

            println!("📥 Loading verdict table...");
            let verdicts = read_verdicts_csv(&args.verdicts)
                .with_context(|| format!("Failed to read verdicts {}", args.verdicts.display()))?;
            println!("✓ Loaded {} verdicts", verdicts.len());

            // The policies that matter are the ones the verdicts were produced under
            if let Some(conn) = &audit {
                record_merge_started(conn, &run_id, &verdicts)?;
            }

            let merged = run_merge(&config, &verdicts, &output_dir, audit.as_ref(), &run_id)?;
            if let Some(conn) = &audit {
                record_run_finished(conn, &run_id, json!({ "merged": merge_counts(&merged) }))?;
            }
        }
        Command::Run { detect, models } => {
            apply_detect_args(&mut config, &detect)?;
            apply_model_args(&mut config, &models);
            if let Some(conn) = &audit {
                record_run_started(conn, &run_id, "run", config.classifier()?.snapshot())?;
            }

            // Models are loaded up front: a broken model must fail before detection starts
            let (model_a, model_b) = load_models(&config)?;

            let outcome = run_detection(&config, &output_dir, audit.as_ref(), &run_id, &cancel)?;
            let merged = merge_and_write(&config, &outcome.verdicts, &model_a, &model_b, &output_dir, audit.as_ref(), &run_id)?;
            finish_run(audit.as_ref(), &run_id, &outcome, Some(&merged))?;
        }
    }

    println!("\n✅ Done");
    Ok(())
}

fn apply_detect_args(config: &mut Config, args: &DetectArgs) -> Result<()> {
    if let Some(dir) = &args.rasters_a {
        config.paths.rasters_a = Some(dir.clone());
    }
    if let Some(dir) = &args.rasters_b {
        config.paths.rasters_b = Some(dir.clone());
    }
    if let Some(workers) = args.workers {
        let Some(detection) = config.detection.as_mut() else {
            bail!("--workers given but the config has no [detection] section");
        };
        detection.workers = Some(workers);
    }
    Ok(())
}

fn apply_model_args(config: &mut Config, args: &ModelArgs) {
    if let Some(path) = &args.model_a {
        config.paths.model_a = Some(path.clone());
    }
    if let Some(path) = &args.model_b {
        config.paths.model_b = Some(path.clone());
    }
}

fn required<'a>(path: &'a Option<PathBuf>, name: &str) -> Result<&'a Path> {
    match path {
        Some(path) => Ok(path.as_path()),
        None => bail!("No {} given (set [paths].{} or pass --{})", name, name, name.replace('_', "-")),
    }
}

// ============================================================================
// DETECTION
// ============================================================================

fn run_detection(
    config: &Config,
    output_dir: &Path,
    audit: Option<&Connection>,
    run_id: &str,
    cancel: &Arc<AtomicBool>,
) -> Result<DetectionOutcome> {
    config.validate()?;
    let detection = config.detection()?;
    let rasters_a = required(&config.paths.rasters_a, "rasters_a")?;
    let rasters_b = required(&config.paths.rasters_b, "rasters_b")?;

    println!("🗂️  Indexing rasters...");
    let source = DirectoryRasterSource::scan(rasters_a, rasters_b)
        .with_context(|| format!("Failed to index {} / {}", rasters_a.display(), rasters_b.display()))?;

    let pipeline = DetectionPipeline::new(
        RasterPairLoader::new(source, detection.resample),
        config.aggregator()?,
        config.classifier()?,
        config.worker_count()?,
    )
    .with_cancel_flag(Arc::clone(cancel));
    println!("🔍 Policy: {}", pipeline.classifier().snapshot().summary);

    let outcome = pipeline.detect_all()?;
    let summary = outcome.summary();
    println!("✓ {} / {} has changed", summary.changed, outcome.requested);
    println!("  unchanged: {}", summary.unchanged);
    println!("  incomparable: {}", summary.incomparable);
    if outcome.cancelled {
        println!("⚠️  Cancelled: {} buildings not processed", outcome.skipped());
    }

    let verdicts_path = output_dir.join(VERDICTS_FILE);
    write_verdicts_csv(&verdicts_path, &outcome.verdicts)
        .with_context(|| format!("Failed to write {}", verdicts_path.display()))?;
    let changed = write_changed_list(&output_dir.join(CHANGED_FILE), &outcome.verdicts)?;
    println!("💾 Wrote {} ({} changed ids in {})", verdicts_path.display(), changed, CHANGED_FILE);

    if let Some(conn) = audit {
        record_verdicts(conn, run_id, &outcome.verdicts)?;
    }

    Ok(outcome)
}

// ============================================================================
// MERGE
// ============================================================================

fn load_models(config: &Config) -> Result<(CityModel, CityModel)> {
    let path_a = required(&config.paths.model_a, "model_a")?;
    let path_b = required(&config.paths.model_b, "model_b")?;

    println!("🏙️  Loading city models...");
    let model_a = CityModel::load(path_a).with_context(|| format!("Failed to load {}", path_a.display()))?;
    let model_b = CityModel::load(path_b).with_context(|| format!("Failed to load {}", path_b.display()))?;
    println!("✓ epochA: {} buildings, epochB: {} buildings", model_a.len(), model_b.len());

    Ok((model_a, model_b))
}

fn run_merge(
    config: &Config,
    verdicts: &Verdicts,
    output_dir: &Path,
    audit: Option<&Connection>,
    run_id: &str,
) -> Result<MergedCityModel> {
    let (model_a, model_b) = load_models(config)?;
    merge_and_write(config, verdicts, &model_a, &model_b, output_dir, audit, run_id)
}

fn merge_and_write(
    config: &Config,
    verdicts: &Verdicts,
    model_a: &CityModel,
    model_b: &CityModel,
    output_dir: &Path,
    audit: Option<&Connection>,
    run_id: &str,
) -> Result<MergedCityModel> {
    println!("🧩 Merging (unchanged buildings from {:?})...", config.merge.retain_epoch);
    let merged = config.merge_engine().merge(verdicts, model_a, model_b)?;

    for (tag, count) in merged.counts() {
        println!("  {}: {}", tag, count);
    }

    let merged_path = output_dir.join(MERGED_FILE);
    merged
        .model
        .save(&merged_path)
        .with_context(|| format!("Failed to write {}", merged_path.display()))?;
    write_provenance_csv(&output_dir.join(PROVENANCE_FILE), &merged.provenance)?;
    println!("💾 Wrote {} ({} buildings)", merged_path.display(), merged.model.len());

    if let Some(conn) = audit {
        record_provenance(conn, run_id, &merged.provenance)?;
    }

    info!(
        missing_representation = merged.provenance.iter().filter(|e| e.issue.is_some()).count(),
        "merge written"
    );

    Ok(merged)
}

fn merge_counts(merged: &MergedCityModel) -> serde_json::Value {
    let counts: serde_json::Map<String, serde_json::Value> = merged
        .counts()
        .into_iter()
        .map(|(tag, count): (ProvenanceTag, usize)| (tag.to_string(), json!(count)))
        .collect();
    serde_json::Value::Object(counts)
}

fn finish_run(
    audit: Option<&Connection>,
    run_id: &str,
    outcome: &DetectionOutcome,
    merged: Option<&MergedCityModel>,
) -> Result<()> {
    let Some(conn) = audit else {
        return Ok(());
    };

    let mut summary = json!({
        "detection": outcome.summary(),
        "cancelled": outcome.cancelled,
    });
    if let Some(merged) = merged {
        summary["merged"] = merge_counts(merged);
    }
    record_run_finished(conn, run_id, summary)
}
