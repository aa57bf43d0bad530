use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_refinery::app::App;
use kira_refinery::config::{ConfigLoader, ResolvedConfig};
use kira_refinery::domain::JobId;
use kira_refinery::downloader::HttpFetcher;
use kira_refinery::error::KiraError;
use kira_refinery::output::{JsonOutput, LocalUploader, LogNotifier, Notifier};
use kira_refinery::processor::SystemQuantTool;
use kira_refinery::store::JsonRecordStore;

type RefineryApp = App<JsonRecordStore, HttpFetcher, SystemQuantTool, LocalUploader>;

#[derive(Parser)]
#[command(name = "kira-refinery")]
#[command(about = "Runs download, process and smash jobs against a local record store")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a pending job to completion")]
    Run(RunArgs),
    #[command(about = "Show a job record and its dataset")]
    Show(ShowArgs),
}

#[derive(Args)]
struct RunArgs {
    job_id: JobId,

    /// Log the outcome instead of printing it as JSON.
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct ShowArgs {
    job_id: JobId,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(kira) = report.downcast_ref::<KiraError>() {
                return ExitCode::from(map_exit_code(kira));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::JobNotFound(_)
        | KiraError::DatasetNotFound(_)
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidJobId(_) => 2,
        KiraError::DownloadHttp(_)
        | KiraError::DownloadStatus { .. }
        | KiraError::MissingTool(_)
        | KiraError::ToolFailed { .. } => 3,
        KiraError::JobKindMismatch { .. } | KiraError::JobTerminal { .. } => 4,
        _ => 1,
    }
}

/// Returns whether the command succeeded; a failed job is not an error.
fn run() -> miette::Result<bool> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = build_app(config)?;

    match cli.command {
        Commands::Run(args) => {
            let notifier: &dyn Notifier = if args.quiet {
                &LogNotifier
            } else {
                &JsonOutput
            };
            let outcome = app.run_job(args.job_id, notifier)?;
            Ok(outcome.success)
        }
        Commands::Show(args) => {
            let report = app.show_job(args.job_id)?;
            JsonOutput::print_json(&report).into_diagnostic()?;
            Ok(true)
        }
    }
}

fn build_app(config: ResolvedConfig) -> miette::Result<RefineryApp> {
    let store = JsonRecordStore::new(config.records_root.clone());
    store.ensure_root()?;
    let fetcher = HttpFetcher::new()?;
    let uploader = LocalUploader::new(config.results_root.clone());
    Ok(App::new(store, config, fetcher, SystemQuantTool::new(), uploader))
}
