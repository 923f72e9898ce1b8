//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docenrich_core::{
    BatchPipeline, EnrichmentClient, OpenAiCompatibleService, ProgressReporter, RunReport,
};
use docenrich_shared::{
    AppConfig, CacheBackend, MalformedPolicy, PipelineOptions, RetryConfig, ServiceConfig,
    init_config, load_config, load_config_from,
};
use docenrich_storage::{FsCache, SqlCache, open_cache};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docenrich: enrich government-document batches with plain-language metadata.
#[derive(Parser)]
#[command(
    name = "docenrich",
    version,
    about = "Enrich JSON-lines batches of official documents with summaries, keywords and affected groups.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.docenrich/docenrich.toml.
    #[arg(long, global = true, env = "DOCENRICH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Malformed-response handling, as accepted on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum MalformedArg {
    Placeholder,
    Fail,
}

impl From<MalformedArg> for MalformedPolicy {
    fn from(arg: MalformedArg) -> Self {
        match arg {
            MalformedArg::Placeholder => MalformedPolicy::Placeholder,
            MalformedArg::Fail => MalformedPolicy::Fail,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Enrich one or more JSON-lines batch files.
    Run {
        /// Batch files to process. Each is rewritten in place.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Write the result here instead of in place (single input only).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of concurrent workers (overrides `pipeline.concurrency`).
        #[arg(short, long)]
        workers: Option<usize>,

        /// What to do with unparseable service answers.
        #[arg(long, value_enum)]
        malformed: Option<MalformedArg>,

        /// Also generate short editorial titles.
        #[arg(long)]
        short_titles: bool,
    },

    /// Response cache management.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Delete every cached response.
    Purge,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(cli.verbose)));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

const LOG_TARGETS: [&str; 4] = [
    "docenrich",
    "docenrich_core",
    "docenrich_shared",
    "docenrich_storage",
];

/// Default `EnvFilter` directives for every workspace crate at the level
/// selected by `-v`.
fn default_directives(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Run {
            inputs,
            output,
            workers,
            malformed,
            short_titles,
        } => cmd_run(config, &inputs, output.as_deref(), workers, malformed, short_titles).await,
        Command::Cache { action } => match action {
            CacheAction::Purge => cmd_cache_purge(&config).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    mut config: AppConfig,
    inputs: &[PathBuf],
    output: Option<&Path>,
    workers: Option<usize>,
    malformed: Option<MalformedArg>,
    short_titles: bool,
) -> Result<()> {
    if output.is_some() && inputs.len() != 1 {
        return Err(eyre!("--output can only be used with a single input file"));
    }

    if let Some(workers) = workers {
        config.pipeline.concurrency = workers;
    }
    if let Some(policy) = malformed {
        config.pipeline.malformed_policy = policy.into();
    }
    if short_titles {
        config.pipeline.short_titles = true;
    }

    // Validate API key before doing anything
    let service_config = ServiceConfig::from_app_config(&config)?;
    let service = Arc::new(OpenAiCompatibleService::new(service_config)?);
    let cache = open_cache(&config).await?;
    let options = PipelineOptions::from(&config);
    let client = EnrichmentClient::new(
        service,
        cache,
        RetryConfig::from(&config.retry),
        options.text_budget_chars,
    );
    let pipeline = BatchPipeline::new(client, options);

    info!(
        files = inputs.len(),
        concurrency = pipeline.options().concurrency,
        model = %config.service.model,
        "starting enrichment"
    );

    let mut failed_files = 0usize;
    for input in inputs {
        let target = output.unwrap_or(input);
        let reporter = CliProgress::new();

        match pipeline.run(input, target, &reporter).await {
            Ok(report) => print_report(&report),
            Err(e) => {
                reporter.bar.finish_and_clear();
                error!(input = %input.display(), error_class = e.class(), error = %e, "run failed");
                eprintln!("  {}: {e}", input.display());
                failed_files += 1;
            }
        }
    }

    if failed_files > 0 {
        return Err(eyre!("{failed_files} of {} batch files failed", inputs.len()));
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("  Batch enriched: {}", report.output.display());
    println!("  Records:      {}", report.total);
    println!("  Selected:     {}", report.selected);
    println!("  Passthrough:  {}", report.passthrough);
    println!("  Enriched:     {}", report.enriched);
    println!("  Placeholders: {}", report.placeholders);
    println!("  Failed:       {}", report.failed);
    println!(
        "  Service:      {} calls, {} retries, {} cache hits",
        report.service_calls, report.retries, report.cache_hits
    );
    println!("  Time:         {:.1}s", report.elapsed.as_secs_f64());
    for failure in &report.failures {
        println!(
            "    ✗ {} [{}] {}",
            failure.record_id, failure.error_class, failure.message
        );
    }
    println!();
}

/// Progress bar for a single batch run.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn record_done(&self, record_id: &str, success: bool, completed: usize, total: usize) {
        if completed == 1 {
            self.bar.set_length(total as u64);
            self.bar.set_style(
                ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
        }
        self.bar.set_position(completed as u64);
        let mark = if success { "✓" } else { "✗" };
        self.bar.set_message(format!("{mark} {record_id}"));
    }

    fn done(&self, _report: &RunReport) {
        self.bar.finish_and_clear();
    }
}

async fn cmd_cache_purge(config: &AppConfig) -> Result<()> {
    let removed = match config.cache.backend {
        CacheBackend::Fs => FsCache::open(&config.cache.dir)?.purge()? as u64,
        CacheBackend::Libsql => SqlCache::open(Path::new(&config.cache.db_path)).await?.purge().await?,
        CacheBackend::Memory => 0,
    };
    println!("Removed {removed} cached responses.");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
