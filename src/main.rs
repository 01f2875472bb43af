use anyhow::{format_err, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info_span};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

use agent_finder::cache::ScrapeCache;
use agent_finder::engine::{build_sources, Resolver};
use agent_finder::errors::display_causes_and_backtrace;
use agent_finder::fsbo::store::FsboStore;
use agent_finder::gateway::shared_http_client;
use agent_finder::input::{read_input, validate_input};
use agent_finder::jobs::JobStore;
use agent_finder::output::{export_results, generate_summary, ExportFormat};
use agent_finder::server::{run_server, AppState, EngineConfig};

/// Output file formats for batch mode. (Helper struct for argument
/// parsing.)
#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatName {
    #[value(name = "csv")]
    Csv,
    #[value(name = "excel")]
    Excel,
}

impl From<OutputFormatName> for ExportFormat {
    fn from(name: OutputFormatName) -> ExportFormat {
        match name {
            OutputFormatName::Csv => ExportFormat::Csv,
            OutputFormatName::Excel => ExportFormat::Excel,
        }
    }
}

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "find listing agents for CSV/Excel files of property addresses"
)]
struct Opt {
    /// Input CSV or Excel file with property addresses (batch mode).
    input: Option<PathBuf>,

    /// Path for the output file.
    #[arg(short = 'o', long = "output", default_value = "output.csv")]
    output: PathBuf,

    /// Output format.
    #[arg(long = "format", default_value = "csv")]
    format: OutputFormatName,

    /// Comma-separated list of sources to consult, in priority order.
    #[arg(long = "sources", default_value = "redfin,homeharvest,realtor,zillow")]
    sources: String,

    /// Max rows resolved concurrently across all sources.
    #[arg(long = "max-concurrent", default_value = "50")]
    max_concurrent: usize,

    /// Google Custom Search API key (enables the google source).
    #[arg(long = "google-api-key", default_value = "")]
    google_api_key: String,

    /// Google Custom Search Engine ID.
    #[arg(long = "google-cse-id", default_value = "")]
    google_cse_id: String,

    /// Skip the contact enrichment step.
    #[arg(long = "no-enrich")]
    no_enrich: bool,

    /// Ignore cached results and re-scrape everything.
    #[arg(long = "no-cache")]
    no_cache: bool,

    /// Path to the cache database.
    #[arg(long = "cache-path", default_value = "agent_finder_cache.db")]
    cache_path: PathBuf,

    /// Validate the input file and show a preview without scraping.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Command to run.
    #[command(subcommand)]
    cmd: Option<Command>,
}

/// Subcommands for agent-finder.
#[derive(Debug, Subcommand)]
enum Command {
    /// Start in server mode.
    Server {
        /// Address that the server should listen on.
        #[arg(long = "listen-address", default_value = "127.0.0.1:9000")]
        listen_address: String,

        /// Directory for uploads, results, and databases.
        #[arg(long = "data-dir", default_value = "data")]
        data_dir: PathBuf,
    },
}

// Our main entrypoint. We rely on the fact that `anyhow::Error` has a `Debug`
// implementation that will print a nice friendly error if we return from `main`
// with an error.
#[tokio::main]
async fn main() -> Result<()> {
    // Configure tracing.
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
    let _span = info_span!("agent-finder").entered();
    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut opt = Opt::parse();

    match opt.cmd.take() {
        Some(Command::Server {
            listen_address,
            data_dir,
        }) => {
            let engine = EngineConfig {
                sources: split_sources(&opt.sources),
                google_api_key: opt.google_api_key.clone(),
                google_cse_id: opt.google_cse_id.clone(),
                enrich: !opt.no_enrich,
                max_concurrent: opt.max_concurrent,
            };
            let state = Arc::new(AppState::new(
                JobStore::load(data_dir.join("jobs.json")),
                ScrapeCache::with_default_ttl(data_dir.join("web_cache.db")),
                FsboStore::new(data_dir.join("fsbo.db")),
                shared_http_client(),
                data_dir,
                engine,
            ));
            run_server(&listen_address, state).await
        }
        None => run_batch(opt).await,
    }
}

fn split_sources(sources: &str) -> Vec<String> {
    sources
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Run the CLI batch pipeline.
async fn run_batch(opt: Opt) -> Result<()> {
    let input = opt
        .input
        .as_deref()
        .ok_or_else(|| format_err!("an input file is required (or use `server`)"))?;

    if opt.dry_run {
        return show_dry_run(input);
    }

    println!("Reading input from {}...", input.display());
    let properties = read_input(input)?;
    println!("Found {} addresses to process.", properties.len());
    if properties.is_empty() {
        println!("No valid addresses found in input file.");
        return Ok(());
    }

    // `--no-cache` runs against a throwaway database instead of the real
    // one, so nothing is reused and nothing durable is written.
    let cache_path = if opt.no_cache {
        std::env::temp_dir().join(format!("agent_finder_nocache_{}.db", std::process::id()))
    } else {
        opt.cache_path.clone()
    };
    let cache = ScrapeCache::with_default_ttl(&cache_path);

    let client = shared_http_client();
    let sources = build_sources(
        &split_sources(&opt.sources),
        &client,
        &opt.google_api_key,
        &opt.google_cse_id,
    );
    if sources.is_empty() {
        return Err(format_err!("no valid sources selected"));
    }

    let resolver = Resolver::new(
        sources,
        cache,
        client,
        !opt.no_enrich,
        opt.max_concurrent,
        None,
    );

    let result = resolver.run(&properties).await;
    if opt.no_cache {
        let _ = std::fs::remove_file(&cache_path);
    }
    let results = match result {
        Ok(results) => results,
        Err(err) => {
            display_causes_and_backtrace(&err);
            return Err(format_err!("batch resolution failed"));
        }
    };

    let output_path = export_results(&results, &opt.output, opt.format.into())?;
    println!("\nResults exported to: {}", output_path.display());

    let summary = generate_summary(&results);
    println!("\nResults Summary");
    println!("  Total addresses:  {}", summary.total);
    println!("  Found (complete): {}", summary.found);
    println!("  Found (partial):  {}", summary.partial);
    println!("  From cache:       {}", summary.cached);
    println!("  Not found:        {}", summary.not_found);
    println!("  Errors:           {}", summary.errors);
    println!("  Success rate:     {}", summary.success_rate);

    if !summary.sources.is_empty() {
        println!("\nSources breakdown:");
        let mut sources: Vec<_> = summary.sources.iter().collect();
        sources.sort_by(|a, b| b.1.cmp(a.1));
        for (source, count) in sources {
            println!("  {}: {}", source, count);
        }
    }
    for tripped in resolver.tripped_sources() {
        println!("  Circuit breaker tripped: {}", tripped);
    }

    Ok(())
}

/// Validate and preview the input file.
fn show_dry_run(input: &std::path::Path) -> Result<()> {
    println!("Dry Run - Input Validation\n");
    let summary = validate_input(input)?;
    println!("  Total addresses: {}", summary.total_rows);
    println!("  With city:       {}", summary.with_city);
    println!("  With state:      {}", summary.with_state);
    println!("  With ZIP:        {}", summary.with_zip);

    if !summary.sample.is_empty() {
        println!("\nSample addresses (first 5):");
        for (i, addr) in summary.sample.iter().enumerate() {
            println!("  {}. {}", i + 1, addr);
        }
    }
    println!("\nInput file looks valid.");
    Ok(())
}
