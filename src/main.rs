use anyhow::Result;
use bibrecon::config::{ReconcileConfig, DEFAULT_BATCH_SIZE};
use bibrecon::pipeline::{self, CreateDbSummary, ReportsSummary, ResolveSummary};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "bibrecon")]
#[command(about = "Reconcile a library-catalog dump against a digitized-holdings dump")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse both dumps and load them into the store
    CreateDb(PathArgs),
    /// Resolve redirects and rebuild the redirect and item-map indices
    ResolveRedirects(PathArgs),
    /// Write every report
    AllReports(PathArgs),
    /// Load, resolve, and report in one go
    Run(PathArgs),
}

#[derive(Args)]
struct PathArgs {
    /// Catalog dump (.txt, optionally .gz or .bz2)
    #[arg(long, default_value = "files/ol_dump_latest.txt.gz")]
    catalog: PathBuf,

    /// Holdings dump (.jsonl or .tsv, optionally .gz or .bz2)
    #[arg(long, default_value = "files/inlibrary.jsonl")]
    holdings: PathBuf,

    /// Directory for the store and the resolver indices
    #[arg(long, default_value = "files")]
    files_dir: PathBuf,

    /// Directory for reports and the error log
    #[arg(long, default_value = "reports")]
    reports_dir: PathBuf,

    /// Records per load transaction and index write batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Skip redirect resolution and the post-resolution reports
    #[arg(long)]
    no_resolve: bool,
}

impl PathArgs {
    fn into_config(self) -> ReconcileConfig {
        let mut config = ReconcileConfig::from_dirs(
            &self.files_dir,
            &self.reports_dir,
            self.catalog,
            self.holdings,
        )
        .with_batch_size(self.batch_size);
        config.resolve = !self.no_resolve;
        config
    }
}

fn print_create_db(summary: &CreateDbSummary) {
    println!();
    println!("=== Load Summary ===");
    println!("Load time:          {:.2}s", summary.duration.as_secs_f64());
    println!();
    println!("Catalog lines:      {}", summary.catalog.lines);
    println!("Editions:           {}", summary.catalog_load.editions);
    println!("Redirects:          {}", summary.catalog_load.redirects);
    println!("Works:              {}", summary.catalog_load.works);
    println!("Ignored lines:      {}", summary.catalog.ignored);
    println!("Skipped lines:      {}", summary.catalog.skipped());
    println!();
    println!("Holdings lines:     {}", summary.holdings.lines);
    println!("Holdings:           {}", summary.holdings_load.holdings);
    println!("Skipped lines:      {}", summary.holdings.skipped());
}

fn print_resolve(summary: &ResolveSummary) {
    let stats = &summary.stats;
    println!();
    println!("=== Resolution Summary ===");
    println!("Resolution time:    {:.2}s", summary.duration.as_secs_f64());
    println!();
    println!("Redirects:          {}", stats.redirects);
    println!("Resolved:           {}", stats.resolved);
    println!("Dangling:           {}", stats.dangling);
    println!("Cyclic:             {}", stats.cyclic);
    println!("Unresolved total:   {}", stats.unresolved());
    println!("Cycles detected:    {}", stats.cycles_detected);
    println!();
    println!("Holdings mapped:    {}", stats.holdings_mapped);
    println!("Without edition:    {}", stats.holdings_unlinked);
    println!("Unresolved edition: {}", stats.holdings_unresolved);
    println!("Without work:       {}", stats.holdings_without_work);
}

fn print_reports(summary: &ReportsSummary) {
    println!();
    println!("=== Report Summary ===");
    println!("Report time:        {:.2}s", summary.duration.as_secs_f64());
    println!();
    for report in &summary.reports {
        println!("{:<40} {:>10} rows", report.name, report.rows);
    }
    if summary.resolved_skipped {
        println!("Post-resolution reports skipped: run resolve-redirects first");
    }
    println!();
    println!("Errors logged:      {}", summary.errors_logged);
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::CreateDb(args) => {
            print_create_db(&pipeline::create_db(&args.into_config())?);
        }
        Commands::ResolveRedirects(args) => {
            print_resolve(&pipeline::resolve_redirects(&args.into_config())?);
        }
        Commands::AllReports(args) => {
            print_reports(&pipeline::all_reports(&args.into_config())?);
        }
        Commands::Run(args) => {
            let summary = pipeline::run(&args.into_config())?;
            print_create_db(&summary.create_db);
            if let Some(resolve) = &summary.resolve {
                print_resolve(resolve);
            }
            print_reports(&summary.reports);
        }
    }
    Ok(())
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

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    match run_command(cli.command) {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
