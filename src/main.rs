//! dscan: distributed web-application scanner

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dscan::{
    config::{Config, LogFormat, LoggingConfig},
    fingerprint::hash_similarity,
    pipeline::Pipeline,
    Scan,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dscan")]
#[command(about = "Distributed web-application scanner with replicated crawl deduplication")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dscan.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl and fuzz a site starting from a seed URL
    Scan {
        /// Seed URL
        url: String,

        /// HTTP method for the seed request
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Body for the seed request
        #[arg(short, long, default_value = "")]
        data: String,
    },

    /// Print the similarity fingerprint of an HTML file
    Fingerprint {
        /// HTML file
        file: PathBuf,

        /// Shingle width (defaults to the configured value)
        #[arg(short, long)]
        shingle: Option<usize>,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(default_value = "dscan.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn init_tracing(logging: &LoggingConfig, verbose: u8) -> Result<()> {
    let level = logging.level.raised(verbose);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    init_tracing(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Scan { url, method, data } => run_scan(config, &url, &method, &data).await,
        Commands::Fingerprint { file, shingle } => fingerprint_file(&config, file, shingle),
        Commands::Init { path, force } => init_config(path, force),
    }
}

async fn run_scan(config: Config, url: &str, method: &str, data: &str) -> Result<()> {
    let seed = Scan::new(method, url, data)?;
    info!(
        job_id = %seed.job.id,
        workers = config.scan.workers,
        fuzzers = ?config.scan.fuzzers,
        "Starting scan of {}",
        seed.request.url
    );

    let pipeline = Pipeline::from_config(&config)?;
    let stats = pipeline.run(seed).await?;

    if stats.seed_unreachable {
        anyhow::bail!("Target {} is unreachable", url);
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn fingerprint_file(config: &Config, file: PathBuf, shingle: Option<usize>) -> Result<()> {
    let body = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read '{}'", file.display()))?;
    let shingle = shingle.unwrap_or(config.dedup.shingle_factor).max(1);
    let fingerprint = hash_similarity(&body, shingle, config.dedup.max_tokens);
    println!("{} {:#018x}", fingerprint, fingerprint);
    Ok(())
}

fn init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("'{}' already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(&path)?;
    println!("Created configuration file: {}", path.display());
    Ok(())
}
