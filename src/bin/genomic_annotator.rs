use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use genomic_annotator::catalog::{CatalogLoader, CatalogSummary};
use genomic_annotator::client::{ReqwestFetcher, SystemCommandRunner};
use genomic_annotator::config::{AnalysisLoader, ConfigLoader};
use genomic_annotator::domain::GenomicUnitType;
use genomic_annotator::error::AnnotatorError;
use genomic_annotator::orchestrator::Orchestrator;
use genomic_annotator::output::{AnnotateResult, HumanOutput, JsonOutput, OutputMode};
use genomic_annotator::queue::seed_with_retry_limit;
use genomic_annotator::store::JsonFileStore;
use genomic_annotator::task::TaskContext;

#[derive(Parser)]
#[command(name = "genomic-annotator")]
#[command(about = "Annotate the genes and variants of an analysis from a dataset catalog")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Annotate every genomic unit of an analysis")]
    Annotate(AnnotateArgs),
    #[command(about = "Check a dataset catalog and list its datasets")]
    Validate(ValidateArgs),
    #[command(about = "Show the stored annotations of one genomic unit")]
    Show(ShowArgs),
}

#[derive(Args)]
struct AnnotateArgs {
    #[arg(long)]
    catalog: PathBuf,

    #[arg(long)]
    analysis: PathBuf,

    /// Store directory, defaults to the platform data directory.
    #[arg(long)]
    store: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Working directory for subprocess datasets.
    #[arg(long)]
    command_dir: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    catalog: PathBuf,
}

#[derive(Args)]
struct ShowArgs {
    #[arg(long)]
    store: Option<Utf8PathBuf>,

    #[arg(long)]
    unit: String,

    #[arg(long, default_value = "gene")]
    unit_type: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<AnnotatorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AnnotatorError) -> u8 {
    match error {
        AnnotatorError::MissingConfig(_)
        | AnnotatorError::ConfigRead(_)
        | AnnotatorError::ConfigParse(_)
        | AnnotatorError::InvalidSetting { .. }
        | AnnotatorError::CatalogRead(_)
        | AnnotatorError::CatalogParse(_)
        | AnnotatorError::InvalidDataset { .. }
        | AnnotatorError::AnalysisRead(_)
        | AnnotatorError::AnalysisParse(_)
        | AnnotatorError::QueryParse { .. }
        | AnnotatorError::InvalidGenomicUnitType(_) => 2,
        AnnotatorError::Store(_) | AnnotatorError::Filesystem(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Annotate(args) => run_annotate(args, output_mode),
        Commands::Validate(args) => run_validate(args, output_mode),
        Commands::Show(args) => run_show(args, output_mode),
    }
}

fn open_store(root: Option<Utf8PathBuf>) -> miette::Result<JsonFileStore> {
    let root = match root {
        Some(root) => root,
        None => JsonFileStore::default_root()?,
    };
    Ok(JsonFileStore::open(root)?)
}

fn run_annotate(args: AnnotateArgs, output_mode: OutputMode) -> miette::Result<()> {
    let mut resolved = ConfigLoader::resolve(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(AnnotatorError::InvalidSetting {
                name: "workers".to_string(),
                message: "at least one worker is required".to_string(),
            }
            .into());
        }
        resolved.scheduler.workers = workers;
    }
    if let Some(max_retries) = args.max_retries {
        resolved.scheduler.max_retries = max_retries;
    }

    let catalog = CatalogLoader::load(&args.catalog)?;
    let analysis = AnalysisLoader::load(&args.analysis)?;
    let store = open_store(args.store)?;

    let http = ReqwestFetcher::new(&resolved.http)?;
    let commands = match args.command_dir {
        Some(dir) => SystemCommandRunner::with_cwd(dir),
        None => SystemCommandRunner::new(),
    };
    let ctx = TaskContext::new(http, commands).with_none_task_max_delay(resolved.none_task_max_delay);
    let orchestrator = Orchestrator::new(ctx, resolved.scheduler.clone());

    let queue = seed_with_retry_limit(&analysis, &catalog, resolved.scheduler.max_retries);
    let report = orchestrator.drain(&queue, &store, &store)?;

    let result = AnnotateResult {
        analysis: analysis.name.clone(),
        store: store.root().to_string(),
        report,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_annotate(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_annotate(&result),
    }
    Ok(())
}

fn run_validate(args: ValidateArgs, output_mode: OutputMode) -> miette::Result<()> {
    let catalog = CatalogLoader::load(&args.catalog)?;
    let summary = CatalogSummary::from(&catalog);
    match output_mode {
        OutputMode::Json => JsonOutput::print_catalog(&summary).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_catalog(&summary),
    }
    Ok(())
}

fn run_show(args: ShowArgs, output_mode: OutputMode) -> miette::Result<()> {
    let unit_type: GenomicUnitType = args.unit_type.parse()?;
    let store = open_store(args.store)?;
    let document = store
        .document(unit_type, &args.unit)?
        .ok_or_else(|| miette::Report::msg(format!("no annotations stored for {}", args.unit)))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_document(&document).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_document(&document),
    }
    Ok(())
}
