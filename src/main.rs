use anyhow::{Context, Result};
use channel_ingest::app::enrich_use_case::EnrichmentReport;
use channel_ingest::app::load_use_case::LoadRunReport;
use channel_ingest::app::ports::CheckpointStore;
use channel_ingest::app::scrape_use_case::ScrapeRunReport;
use channel_ingest::config::AppConfig;
use channel_ingest::infra::fs_raw_store::parse_partition;
use channel_ingest::logging;
use channel_ingest::metrics;
use channel_ingest::pipeline::{Components, Pipeline};
use channel_ingest::types::{normalize_channel_name, PartitionFormat, PartitionKey};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "channel_ingest")]
#[command(about = "Channel message scraper, raw store loader and media enrichment")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Directory for rotated JSON logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape new messages from the configured channels into the raw store
    Scrape {
        /// Specific channels to scrape (comma-separated)
        #[arg(long)]
        channels: Option<String>,
    },
    /// Load raw store partitions into the warehouse
    Load {
        /// Reload every partition, not just new or changed ones
        #[arg(long)]
        force: bool,
    },
    /// Run object detection over loaded messages with media
    Enrich {
        /// Maximum number of messages to process
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Scrape, load and enrich in sequence
    Run {
        /// Specific channels to scrape (comma-separated)
        #[arg(long)]
        channels: Option<String>,
    },
    /// Inspect or reset channel checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Check a raw store partition file against the record schema
    Validate {
        /// Path to a `.ndjson` or legacy `.json` partition
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Show stored checkpoints
    Show,
    /// Forget a channel's checkpoint so the next scrape starts from the beginning
    Reset { channel: String },
}

fn print_scrape(report: &ScrapeRunReport) {
    println!("\n📥 Scrape run {}:", report.run_id);
    for ch in &report.channels {
        let cursor = ch
            .checkpoint
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        match &ch.error {
            None => println!(
                "   ✅ {}: {} records, {} invalid, {} media failures, checkpoint {}",
                ch.channel, ch.records_written, ch.invalid, ch.media_failures, cursor
            ),
            Some(e) => println!(
                "   ❌ {}: {} records before failure, checkpoint {} ({})",
                ch.channel, ch.records_written, cursor, e
            ),
        }
    }
}

fn print_load(report: &LoadRunReport) {
    println!("\n🗄️  Load run {}:", report.run_id);
    for p in &report.partitions {
        println!(
            "   {}: {} inserted, {} updated, {} duplicate, {} invalid",
            p.partition, p.inserted, p.updated, p.skipped_duplicate, p.skipped_invalid
        );
    }
    println!("   Unchanged partitions: {}", report.unchanged);
    if !report.failed.is_empty() {
        println!("\n⚠️  Failed partitions:");
        for (partition, e) in &report.failed {
            println!("   - {}: {}", partition, e);
        }
    }
}

fn print_enrich(report: &EnrichmentReport) {
    println!("\n🔍 Enrichment:");
    println!("   Processed: {}", report.processed);
    println!("   Enriched: {} ({} without an image)", report.enriched, report.skipped);
    println!("   Detections: {}", report.detections);
    println!("   Failed: {}", report.failed);
    if !report.errors.is_empty() {
        println!("\n⚠️  Unrecorded outcomes:");
        for e in &report.errors {
            println!("   - {}", e);
        }
    }
}

fn validate_file(path: &Path) -> Result<bool> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => PartitionFormat::LegacyJsonArray,
        _ => PartitionFormat::Ndjson,
    };
    let channel = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let key = PartitionKey {
        date: Utc::now().date_naive(),
        channel,
        format,
    };
    let contents = parse_partition(&key, &bytes)?;
    let mut valid = true;
    for (idx, record) in contents.records.iter().enumerate() {
        if let Err(e) = record {
            valid = false;
            eprintln!("- line {}: {}", idx + 1, e);
        }
    }
    Ok(valid)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(&cli.log_dir);

    if let Commands::Validate { path } = &cli.command {
        if validate_file(path)? {
            println!("valid");
            return Ok(());
        }
        eprintln!("invalid");
        std::process::exit(1);
    }

    metrics::init_metrics();
    let config = AppConfig::load(&cli.config)?;
    let components = Components::from_config(config)?;

    let shutdown = components.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing the current batch");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    match cli.command {
        Commands::Scrape { channels } => {
            components.config.source_token()?;
            println!("🔄 Scraping channels...");
            let selected = components.config.select_channels(channels.as_deref());
            let report = components.scraper().scrape_all(&selected).await;
            print_scrape(&report);
        }
        Commands::Load { force } => {
            println!("🔄 Loading partitions{}...", if force { " (forced)" } else { "" });
            let report = components.loader().load_pending(force).await?;
            print_load(&report);
        }
        Commands::Enrich { limit } => {
            let limit = limit.unwrap_or(components.config.enrichment.batch_size);
            let report = components.enricher()?.run(limit).await?;
            print_enrich(&report);
        }
        Commands::Run { channels } => {
            components.config.source_token()?;
            println!("🚀 Running full pipeline (scrape + load + enrich)...");
            let selected = components.config.select_channels(channels.as_deref());
            match Pipeline::run(&components, &selected).await {
                Ok(report) => {
                    print_scrape(&report.scrape);
                    print_load(&report.load);
                    match &report.enrich {
                        Some(e) => print_enrich(e),
                        None => println!("\n🔍 Enrichment skipped: no detector configured"),
                    }
                    info!("Pipeline finished");
                }
                Err(e) => {
                    error!("Pipeline failed: {}", e);
                    println!("❌ Pipeline failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show => {
                let checkpoints = components.meta.list_checkpoints()?;
                if checkpoints.is_empty() {
                    println!("No checkpoints stored");
                }
                for cp in checkpoints {
                    println!("{:<32} {:>12}  {}", cp.channel, cp.cursor, cp.updated_at.to_rfc3339());
                }
            }
            CheckpointAction::Reset { channel } => {
                let channel = normalize_channel_name(&channel);
                components.checkpoints.reset_checkpoint(&channel).await?;
                println!("✅ Checkpoint for {} reset", channel);
            }
        },
        Commands::Validate { .. } => {}
    }
    Ok(())
}
