use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::ProgressBar;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wikiflow::config::{NamespaceFilter, PipelineConfig, DEFAULT_IMAGE_BASE_URL, DEFAULT_IMAGE_DIR};
use wikiflow::extractor::WikitextExtractor;
use wikiflow::fetch::HttpImageFetcher;
use wikiflow::pipeline::{Pipeline, RunSummary};
use wikiflow::sink::{read_error_log, RecordReader};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wikiflow")]
#[command(about = "Stream Wikipedia dumps into cleaned article records")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction pipeline over a dump
    Run(RunArgs),
    /// Summarise a result or error file written by `run`
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the dump (.xml or .xml.bz2)
    #[arg(short, long)]
    input: PathBuf,

    /// Result file (bincode record stream)
    #[arg(short, long)]
    output: PathBuf,

    /// Error file (JSON Lines)
    #[arg(short, long)]
    errors: PathBuf,

    /// Download images referenced by each page
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    download_images: bool,

    #[arg(long, default_value_t = wikiflow::config::EXTRACTION_WORKERS)]
    extraction_workers: usize,

    #[arg(long, default_value_t = wikiflow::config::IMAGE_WORKERS)]
    image_workers: usize,

    /// Directory downloaded images are stored in
    #[arg(long, default_value = DEFAULT_IMAGE_DIR)]
    image_dir: PathBuf,

    /// Namespace ids to keep (repeatable; default: main namespace only)
    #[arg(long = "namespace")]
    namespaces: Vec<i64>,

    /// Keep pages of every namespace
    #[arg(long, conflicts_with = "namespaces")]
    all_namespaces: bool,

    /// Seconds to wait for in-flight work once the dump is exhausted
    #[arg(long, default_value_t = wikiflow::config::DRAIN_TIMEOUT.as_secs())]
    drain_timeout_secs: u64,

    /// Base URL image file names are appended to
    #[arg(long, default_value = DEFAULT_IMAGE_BASE_URL)]
    image_base_url: String,
}

#[derive(Args)]
#[group(required = true, multiple = true)]
struct InspectArgs {
    /// Result file to read back
    #[arg(long)]
    results: Option<PathBuf>,

    /// Error file to read back
    #[arg(long)]
    errors: Option<PathBuf>,
}

fn build_config(args: &RunArgs) -> PipelineConfig {
    let namespace_filter = if args.all_namespaces {
        NamespaceFilter::Any
    } else if args.namespaces.is_empty() {
        NamespaceFilter::main_only()
    } else {
        NamespaceFilter::Only(args.namespaces.clone())
    };

    PipelineConfig {
        namespace_filter,
        extraction_workers: args.extraction_workers,
        image_workers: args.image_workers,
        image_download_enabled: args.download_images,
        image_dir: args.image_dir.clone(),
        drain_timeout: Duration::from_secs(args.drain_timeout_secs),
        ..PipelineConfig::default()
    }
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    println!();
    println!("=== Summary ===");
    println!("Total time:         {:.2}s", summary.elapsed.as_secs_f64());
    println!("Drain time:         {:.2}s", summary.drain_time.as_secs_f64());
    println!();
    println!("Pages read:         {}", stats.pages_read);
    println!("Records written:    {}", stats.records_written);
    println!("Errors written:     {}", stats.errors_written);
    println!("Extraction errors:  {}", stats.extraction_failures);
    println!("Image tasks done:   {}", stats.images_fetched);
    println!("Image failures:     {}", stats.image_failures);
    println!("Rate-limit retries: {}", stats.rate_limit_retries);
    println!("Write failures:     {}", stats.write_failures);
    println!("Abandoned:          {}", stats.abandoned);
    if summary.forced {
        println!("Shutdown:           forced after drain timeout");
    }
}

/// Returns true when the run ended without a fatal stream error.
fn run_pipeline(args: RunArgs) -> Result<bool> {
    let config = build_config(&args);
    let extractor = WikitextExtractor::new(&args.image_base_url)?;
    let fetcher = HttpImageFetcher::new()?;

    let pb = ProgressBar::new_spinner();
    let pipeline = Pipeline::new(config, Arc::new(extractor), Arc::new(fetcher)).with_progress(pb);

    info!(input = %args.input.display(), "Starting run");
    let summary = pipeline
        .run_files(&args.input, &args.output, &args.errors)
        .context("Pipeline failed to start")?;

    print_summary(&summary);
    if summary.forced {
        warn!("Drain timed out; unfinished work was recorded in the error file");
    }
    match &summary.stream_error {
        Some(e) => {
            error!(error = %e, "Dump ended early");
            eprintln!("Error: dump ended early: {e}");
            Ok(false)
        }
        None => Ok(true),
    }
}

fn run_inspect(args: InspectArgs) -> Result<bool> {
    if let Some(path) = &args.results {
        let mut records = 0u64;
        let mut with_images = 0u64;
        let mut categories = 0u64;
        let mut bytes = 0u64;
        for record in RecordReader::open(path)? {
            let record = record.with_context(|| format!("After {records} records in {:?}", path))?;
            records += 1;
            bytes += record.sentences.len() as u64;
            categories += record.categories.len() as u64;
            if !record.images.is_none() {
                with_images += 1;
            }
        }
        println!("=== Results: {} ===", path.display());
        println!("Records:            {records}");
        println!("Text bytes:         {bytes}");
        println!("Categories:         {categories}");
        println!("With images:        {with_images}");
    }

    if let Some(path) = &args.errors {
        let errors = read_error_log(path)?;
        let mut per_stage = BTreeMap::new();
        for record in &errors {
            *per_stage.entry(record.stage.to_string()).or_insert(0u64) += 1;
        }
        println!("=== Errors: {} ===", path.display());
        println!("Records:            {}", errors.len());
        for (stage, count) in per_stage {
            println!("  {stage:<17} {count}");
        }
    }
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Inspect(args) => run_inspect(args),
    };

    match result {
        Ok(true) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
