use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fiscal_xml_sync::config::{ConfigLoader, ResolvedConfig};
use fiscal_xml_sync::directory::StaticDirectory;
use fiscal_xml_sync::domain::{DateRange, DocumentCategory, OutcomeStatus, RetrievalMode};
use fiscal_xml_sync::engine::Engine;
use fiscal_xml_sync::error::SyncError;
use fiscal_xml_sync::outcome::{FileOutcomeStore, OutcomeFilter};
use fiscal_xml_sync::output::JsonOutput;
use fiscal_xml_sync::schedule::ScheduleManager;
use fiscal_xml_sync::source::SiegHttpClient;

type LiveEngine = Engine<SiegHttpClient, FileOutcomeStore, StaticDirectory>;

#[derive(Parser)]
#[command(name = "xml-sync")]
#[command(about = "Fiscal document (NF-e, CT-e, NFS-e, NFC-e, CF-e) synchronization")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Config file (defaults to ./xml-sync.json)")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Retrieve documents for a subscriber now")]
    Run(RunArgs),
    #[command(about = "Delete outcomes and files past their retention window")]
    Purge,
    #[command(about = "Inspect or delete retrieval outcomes")]
    Outcomes(OutcomesArgs),
    #[command(about = "Print the trigger plan derived from schedule preferences")]
    Schedule,
    #[command(about = "Run scheduled retrievals and daily housekeeping until stopped")]
    Daemon,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    subscriber: String,

    #[arg(long, help = "Restrict the run to one tax identifier")]
    tax_identifier: Option<String>,

    #[arg(long = "category")]
    categories: Vec<DocumentCategory>,

    #[arg(long, conflicts_with_all = ["from", "to"], help = "Single emission date (YYYY-MM-DD)")]
    date: Option<NaiveDate>,

    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,

    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,

    #[arg(long, default_value = "manual")]
    mode: RetrievalMode,
}

#[derive(Args)]
struct OutcomesArgs {
    #[command(subcommand)]
    command: OutcomesCommand,
}

#[derive(Subcommand)]
enum OutcomesCommand {
    #[command(about = "List outcomes, newest first")]
    List(ListArgs),
    #[command(about = "Show one outcome")]
    Show { id: Uuid },
    #[command(about = "Delete one outcome and its archived file")]
    Delete { id: Uuid },
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    subscriber: Option<String>,

    #[arg(long)]
    tax_identifier: Option<String>,

    #[arg(long)]
    category: Option<DocumentCategory>,

    #[arg(long)]
    status: Option<OutcomeStatus>,

    #[arg(long)]
    from: Option<NaiveDate>,

    #[arg(long)]
    to: Option<NaiveDate>,

    #[arg(long, default_value_t = 1)]
    page: usize,

    #[arg(long, default_value_t = 50)]
    limit: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        error if error.is_configuration() => 2,
        SyncError::SourceHttp(_)
        | SyncError::SourceStatus { .. }
        | SyncError::SourceExhausted { .. } => 3,
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
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_sync(args, resolved),
        Commands::Purge => {
            let engine = build_engine(resolved)?;
            let report = engine.purge_expired()?;
            JsonOutput::print_purge(&report).into_diagnostic()
        }
        Commands::Outcomes(args) => run_outcomes(args, resolved),
        Commands::Schedule => {
            let engine = build_engine(resolved)?;
            let plan = ScheduleManager::new(Arc::new(engine), 1).plan()?;
            JsonOutput::print_plan(&plan).into_diagnostic()
        }
        Commands::Daemon => {
            let workers = resolved.settings.workers;
            let engine = Arc::new(build_engine(resolved)?);
            let handle = ScheduleManager::new(engine, workers).start()?;
            info!("daemon running; stop with Ctrl-C");
            handle.wait();
            Ok(())
        }
    }
}

fn build_engine(resolved: ResolvedConfig) -> Result<LiveEngine, SyncError> {
    let settings = resolved.settings;
    let source = SiegHttpClient::new(
        &settings.api_base_url,
        settings.request_timeout,
        settings.retry.clone(),
    )?;
    let store = FileOutcomeStore::open(settings.outcomes_dir())?;
    Ok(Engine::new(source, store, resolved.directory, settings.engine))
}

fn run_sync(args: RunArgs, resolved: ResolvedConfig) -> miette::Result<()> {
    let range = match (args.date, args.from, args.to) {
        (Some(date), _, _) => Some(DateRange::single(date)),
        (None, Some(from), Some(to)) => Some(DateRange::new(from, to)?),
        _ => None,
    };
    let categories = (!args.categories.is_empty()).then_some(args.categories.as_slice());

    let engine = build_engine(resolved)?;
    let summary = match &args.tax_identifier {
        Some(tax_identifier) => engine.run_for_tax_identifier(
            &args.subscriber,
            tax_identifier,
            categories,
            range,
            args.mode,
        )?,
        None => engine.run_for_subscriber(&args.subscriber, args.mode, categories, range)?,
    };
    JsonOutput::print_run(&summary).into_diagnostic()
}

fn run_outcomes(args: OutcomesArgs, resolved: ResolvedConfig) -> miette::Result<()> {
    let engine = build_engine(resolved)?;
    match args.command {
        OutcomesCommand::List(list) => {
            let filter = OutcomeFilter {
                subscriber_id: list.subscriber,
                tax_identifier_id: list.tax_identifier,
                category: list.category,
                status: list.status,
                retrieved_from: list.from,
                retrieved_to: list.to,
                page: list.page,
                limit: list.limit,
            };
            let page = engine.outcomes(&filter)?;
            JsonOutput::print_outcomes(&page).into_diagnostic()
        }
        OutcomesCommand::Show { id } => {
            let outcome = engine
                .outcome(id)?
                .ok_or_else(|| SyncError::OutcomeNotFound(id.to_string()))?;
            JsonOutput::print_outcome(&outcome).into_diagnostic()
        }
        OutcomesCommand::Delete { id } => {
            engine.delete_outcome(id)?;
            info!(outcome = %id, "outcome deleted");
            Ok(())
        }
    }
}
