use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use paper_harvest::app::{
    self, App, DownloadInput, DownloadOptions, DownloadResult, RetryOptions, RetryResult,
    VerifyResult,
};
use paper_harvest::batch::BatchOptions;
use paper_harvest::config::{ConfigLoader, ResolvedConfig, expand_path};
use paper_harvest::domain::SourcePolicy;
use paper_harvest::error::HarvestError;
use paper_harvest::output::{JsonOutput, LogProgress, OutputMode};
use paper_harvest::probe::HttpProber;
use paper_harvest::search::{
    ArxivClient, DEFAULT_JSON_DIR, DEFAULT_MAX_RESULTS, SearchReport, SearchRequest,
};
use paper_harvest::store::OutputStore;
use paper_harvest::transfer::WgetTransfer;
use paper_harvest::verify::{DEFAULT_LOG_DIR, DEFAULT_MIN_SIZE_KB, VerifyOptions};
use paper_harvest::worker::FetchOptions;

const NOTHING_SUCCEEDED: u8 = 4;

#[derive(Parser)]
#[command(name = "paper-harvest")]
#[command(about = "Concurrent paper PDF downloader with deduplication and a retryable failure ledger")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true, help = "Config file (default: ./paper-harvest.json if present)")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search arXiv and save the results as a download input file")]
    Search(SearchArgs),
    #[command(about = "Download the PDFs listed in search result JSON files")]
    Download(DownloadArgs),
    #[command(about = "Retry the entries of a failure ledger")]
    Retry(RetryArgs),
    #[command(about = "Find and remove truncated or corrupted PDFs")]
    Verify(VerifyArgs),
}

#[derive(Args, Clone)]
struct SearchArgs {
    #[arg(long)]
    keyword: String,

    #[arg(long, help = "arXiv subcategory such as cs.AI")]
    category: String,

    #[arg(long, default_value_t = DEFAULT_MAX_RESULTS)]
    max_results: usize,

    #[arg(long, help = "File name (default: <keyword>_<category>_<timestamp>.json)")]
    output_json: Option<String>,

    #[arg(long, default_value = DEFAULT_JSON_DIR)]
    json_dir: String,
}

#[derive(Args, Clone)]
struct SourceArgs {
    #[arg(long, value_enum)]
    download_source: Option<SourcePolicy>,

    #[arg(long, help = "Per-file timeout in seconds")]
    timeout: Option<u64>,

    #[arg(long, help = "Concurrent downloads per batch")]
    workers: Option<usize>,
}

#[derive(Args, Clone)]
#[command(group(ArgGroup::new("input").required(true).args(["input_json", "input_dir"])))]
struct DownloadArgs {
    #[arg(long)]
    input_json: Option<String>,

    #[arg(long)]
    input_dir: Option<String>,

    #[arg(long)]
    output_dir: String,

    #[command(flatten)]
    source: SourceArgs,

    #[arg(long, help = "Ledger file name inside the output directory")]
    failed_log: Option<String>,

    #[arg(long, help = "Index every PDF under the output directory before downloading")]
    global_deduplication: bool,
}

#[derive(Args, Clone)]
struct RetryArgs {
    #[arg(long)]
    failed_log_file: String,

    #[arg(long)]
    output_dir: String,

    #[command(flatten)]
    source: SourceArgs,

    #[arg(long, help = "Skip indexing the output directory before retrying")]
    disable_global_dedup: bool,
}

#[derive(Args, Clone)]
struct VerifyArgs {
    pdf_directory: String,

    #[arg(long, default_value_t = DEFAULT_MIN_SIZE_KB)]
    min_size_kb: u64,

    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: String,

    #[arg(long)]
    search_json_dir: Option<String>,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(harvest) = report.downcast_ref::<HarvestError>() {
                return ExitCode::from(map_exit_code(harvest));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidInput(_)
        | HarvestError::InputRead { .. }
        | HarvestError::InputParse { .. }
        | HarvestError::LedgerRead { .. }
        | HarvestError::LedgerParse { .. } => 2,
        HarvestError::ProbeHttp(_)
        | HarvestError::SearchHttp(_)
        | HarvestError::SearchParse(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Search(args) => run_search(args, &config, output_mode),
        Commands::Download(args) => run_download(args, &config, output_mode),
        Commands::Retry(args) => run_retry(args, &config, output_mode),
        Commands::Verify(args) => run_verify(args, &config, output_mode),
    }
}

fn run_search(
    args: SearchArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let request = SearchRequest {
        keyword: args.keyword,
        category: args.category,
        max_results: args.max_results,
    };
    let json_dir = expand_path(&args.json_dir)?;
    let client = ArxivClient::new(&config.search)?;
    let file_name = args.output_json.as_deref();

    let report = match output_mode {
        OutputMode::NonInteractive => {
            let report =
                app::search(&client, &request, &config.search, &json_dir, file_name, &JsonOutput)?;
            JsonOutput::print_search(&report).into_diagnostic()?;
            report
        }
        OutputMode::Interactive => {
            let report =
                app::search(&client, &request, &config.search, &json_dir, file_name, &LogProgress)?;
            print_search_summary(&report);
            report
        }
    };
    Ok(exit_code(report.error.is_some()))
}

fn batch_options(args: &SourceArgs, config: &ResolvedConfig) -> miette::Result<BatchOptions> {
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(config.timeout);
    let concurrency = args.workers.unwrap_or(config.workers);
    if concurrency == 0 {
        return Err(miette::Report::msg("--workers must be at least 1"));
    }
    if timeout.is_zero() {
        return Err(miette::Report::msg("--timeout must be at least 1"));
    }
    Ok(BatchOptions {
        fetch: FetchOptions {
            policy: args.download_source.unwrap_or(config.download_source),
            timeout,
        },
        concurrency,
    })
}

fn build_app(
    output_dir: &str,
    config: &ResolvedConfig,
) -> miette::Result<App<WgetTransfer, HttpProber>> {
    let store = OutputStore::new(expand_path(output_dir)?);
    let transfer = WgetTransfer::new(config.transfer.clone());
    if transfer.locate().is_none() {
        warn!(
            program = transfer.program(),
            "transfer program not found on PATH; every download will fail until it is installed"
        );
    }
    let prober = HttpProber::new(config.probe)?;
    Ok(App::new(store, transfer, prober, config.mirror_base.clone()))
}

fn run_download(
    args: DownloadArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let input = match (&args.input_json, &args.input_dir) {
        (Some(file), _) => DownloadInput::File(expand_path(file)?),
        (None, Some(dir)) => DownloadInput::Directory(expand_path(dir)?),
        (None, None) => return Err(miette::Report::msg("--input-json or --input-dir is required")),
    };
    let options = DownloadOptions {
        batch: batch_options(&args.source, config)?,
        failed_log: args
            .failed_log
            .clone()
            .unwrap_or_else(|| config.failed_log.clone()),
        global_dedup: args.global_deduplication,
    };
    let app = build_app(&args.output_dir, config)?;

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.download(input, options, &JsonOutput)?;
            JsonOutput::print_download(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.download(input, options, &LogProgress)?;
            print_download_summary(&result);
            result
        }
    };
    Ok(exit_code(result.nothing_succeeded()))
}

fn run_retry(
    args: RetryArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let options = RetryOptions {
        batch: batch_options(&args.source, config)?,
        global_dedup: !args.disable_global_dedup,
    };
    let ledger_path = expand_path(&args.failed_log_file)?;
    let app = build_app(&args.output_dir, config)?;

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.retry(&ledger_path, options, &JsonOutput)?;
            JsonOutput::print_retry(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.retry(&ledger_path, options, &LogProgress)?;
            print_retry_summary(&result);
            result
        }
    };
    Ok(exit_code(result.nothing_succeeded()))
}

fn run_verify(
    args: VerifyArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let root = expand_path(&args.pdf_directory)?;
    let options = VerifyOptions {
        min_size_kb: args.min_size_kb,
        log_dir: expand_path(&args.log_dir)?,
        search_json_dir: args
            .search_json_dir
            .as_deref()
            .map(expand_path)
            .transpose()?,
        dry_run: args.dry_run,
        mirror_base: config.mirror_base.clone(),
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app::verify(&root, &options, &JsonOutput)?;
            JsonOutput::print_verify(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app::verify(&root, &options, &LogProgress)?;
            print_verify_summary(&result);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(nothing_succeeded: bool) -> ExitCode {
    if nothing_succeeded {
        ExitCode::from(NOTHING_SUCCEEDED)
    } else {
        ExitCode::SUCCESS
    }
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn print_search_summary(report: &SearchReport) {
    println!("{CYAN}🔎 paper-harvest search summary{RESET}");
    println!("{CYAN}• query: {}{RESET}", report.query);
    match &report.error {
        Some(error) => println!("{RED}❌ Search failed: {error}{RESET}"),
        None => println!("{GREEN}✅ Papers found: {}{RESET}", report.results_count),
    }
    println!(
        "{YELLOW}📝 Results written to {}; feed it to `paper-harvest download --input-json`{RESET}",
        report.output
    );
}

fn print_download_summary(result: &DownloadResult) {
    let totals = &result.totals;
    println!("{CYAN}📦 paper-harvest download summary{RESET}");
    println!("{GREEN}✅ Downloaded: {}{RESET}", totals.downloaded);
    println!(
        "{GREEN}♻️ Already present: {} in partition, {} elsewhere{RESET}",
        totals.existed_subdir, totals.existed_global
    );
    if totals.failed > 0 {
        println!("{RED}❌ Failed: {}{RESET}", totals.failed);
    } else {
        println!("{YELLOW}⚠️ Failed: 0{RESET}");
    }
    if totals.skipped_without_id > 0 {
        println!("{YELLOW}⚠️ Skipped without entry_id: {}{RESET}", totals.skipped_without_id);
    }

    for batch in &result.batches {
        println!(
            "{CYAN}• {} -> {} ({} planned, {} failed){RESET}",
            batch.source, batch.partition, batch.totals.planned, batch.totals.failed
        );
    }
    for path in &result.unreadable_inputs {
        println!("{RED}• unreadable input: {path}{RESET}");
    }

    if let Some(ledger) = &result.ledger {
        println!(
            "{YELLOW}📝 {} unresolved failures in {ledger}; run `paper-harvest retry --failed-log-file {ledger} --output-dir {}`{RESET}",
            result.ledger_entries, result.output_dir
        );
    }
}

fn print_retry_summary(result: &RetryResult) {
    println!("{CYAN}📦 paper-harvest retry summary{RESET}");
    println!("{GREEN}✅ Recovered: {}{RESET}", result.recovered);
    let color = if result.still_failing > 0 { RED } else { YELLOW };
    println!("{color}❌ Still failing: {}{RESET}", result.still_failing);
    if result.kept_unprocessed > 0 {
        println!("{YELLOW}⚠️ Kept without retry: {}{RESET}", result.kept_unprocessed);
    }
    if result.ledger_removed {
        println!("{GREEN}🧹 Ledger {} removed, nothing left to retry{RESET}", result.ledger);
    } else if result.still_failing + result.kept_unprocessed > 0 {
        println!("{YELLOW}📝 Remaining failures kept in {}{RESET}", result.ledger);
    }
}

fn print_verify_summary(result: &VerifyResult) {
    let summary = &result.summary;
    println!("{CYAN}📦 paper-harvest verify summary{RESET}");
    println!("{GREEN}✅ Checked: {}{RESET}", summary.checked);
    let color = if summary.corrupted.is_empty() { GREEN } else { RED };
    println!("{color}❌ Corrupted: {}{RESET}", summary.corrupted.len());
    for item in &summary.corrupted {
        let action = if item.deleted {
            "deleted"
        } else if result.dry_run {
            "would delete"
        } else {
            "kept"
        };
        println!("{YELLOW}   {} ({}, {action}){RESET}", item.relative_path, item.reason);
    }
    if let Some(list) = &summary.retry_list {
        println!(
            "{YELLOW}📝 Retry list written to {list}; feed it to `paper-harvest download --input-json`{RESET}"
        );
    }
}
