//! ChainArchive CLI: runs ingestion streams and sitemap families.
//!
//! # Commands
//! ```
//! chainarchive ingest        --entity <blocks|txids|addresses>
//! chainarchive sitemap       --family <name>
//! chainarchive run
//! chainarchive status
//! chainarchive rebuild-index --family <name>
//! chainarchive info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chainarchive_bitcoin::{producer_for, BitcoinRpcClient};
use chainarchive_core::checkpoint::read_checkpoint;
use chainarchive_core::{
    shutdown_channel, Entity, IngestConfig, IngestExit, IngestionLoop, LogSink, MetadataSink,
    Shutdown, ShutdownTrigger,
};
use chainarchive_sitemap::{
    rebuild_root_index, validate_shard, ShardIndexBuilder, ShardIndexState, SitemapConfig,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::task::JoinSet;

mod config;
mod logging;

use config::AppConfig;

#[derive(Parser)]
#[command(
    name = "chainarchive",
    about = "Crash-safe Bitcoin ledger archiver and sitemap builder",
    long_about = "
ChainArchive: pull block headers, transaction ids and address deltas from a
Bitcoin Core node into segmented JSONL files, and build sitemap shards from them.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides the log filter from the config file
",
    version
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "chainarchive.json")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion stream
    Ingest {
        /// blocks | txids | addresses
        #[arg(short, long)]
        entity: Entity,
    },
    /// Run one sitemap family
    Sitemap {
        #[arg(short, long)]
        family: String,
    },
    /// Run every configured stream and family until Ctrl-C or the first error
    Run,
    /// Print checkpoints, family states and shard validity as JSON
    Status,
    /// Rewrite a family's root index from the shard files on disk
    #[command(name = "rebuild-index")]
    RebuildIndex {
        #[arg(short, long)]
        family: String,
    },
    /// Show version and configured work
    Info,
}

/// Process-wide handles shared by every loop.
#[derive(Clone)]
struct AppContext {
    rpc: Arc<BitcoinRpcClient>,
    sink: Arc<dyn MetadataSink>,
    trigger: Arc<ShutdownTrigger>,
    /// Held so the channel stays open before any loop subscribes.
    shutdown: Shutdown,
}

impl AppContext {
    fn new(config: &AppConfig) -> Result<Self> {
        let rpc = BitcoinRpcClient::new(&config.rpc).context("building the Bitcoin RPC client")?;
        let (trigger, shutdown) = shutdown_channel();
        Ok(Self {
            rpc: Arc::new(rpc),
            sink: Arc::new(LogSink),
            trigger: Arc::new(trigger),
            shutdown,
        })
    }

    /// Triggers shutdown on Ctrl-C.
    fn install_ctrl_c(&self) {
        let trigger = self.trigger.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
                trigger.trigger();
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    let mut log = config.log.clone();
    if cli.verbose {
        log.level = "debug".into();
    }
    logging::init_tracing(&log);

    match cli.command {
        Commands::Ingest { entity } => {
            let stream = config.stream(entity)?.clone();
            let ctx = AppContext::new(&config)?;
            ctx.install_ctrl_c();
            run_stream(ctx, stream).await
        }

        Commands::Sitemap { family } => {
            let family = config.sitemap(&family)?.clone();
            let ctx = AppContext::new(&config)?;
            ctx.install_ctrl_c();
            run_family(ctx, family).await
        }

        Commands::Run => {
            let ctx = AppContext::new(&config)?;
            ctx.install_ctrl_c();
            cmd_run(ctx, &config).await
        }

        Commands::Status => cmd_status(&config),

        Commands::RebuildIndex { family } => cmd_rebuild_index(config.sitemap(&family)?),

        Commands::Info => cmd_info(&config, &cli.config),
    }
}

// ─── Loops ───────────────────────────────────────────────────────────────────

async fn run_stream(ctx: AppContext, config: IngestConfig) -> Result<()> {
    let entity = config.entity;
    let producer = producer_for(entity, ctx.rpc.clone());
    let mut ingest = IngestionLoop::with_file_store(config, producer, ctx.sink.clone())
        .with_context(|| format!("starting the {entity} stream"))?;

    let mut shutdown = ctx.shutdown.clone();
    let exit = ingest
        .run(&mut shutdown)
        .await
        .with_context(|| format!("{entity} stream failed"))?;

    let stats = ingest.stats();
    tracing::info!(
        %entity,
        exit = ?exit,
        positions = stats.positions_processed,
        records = stats.records_written,
        "stream finished"
    );
    if exit == IngestExit::Completed {
        println!(
            "{entity}: completed at position {}",
            ingest
                .checkpoint()
                .last_position_written
                .map_or_else(|| "-".to_string(), |p| p.to_string())
        );
    }
    Ok(())
}

async fn run_family(ctx: AppContext, config: SitemapConfig) -> Result<()> {
    let name = config.name.clone();
    let mut builder = ShardIndexBuilder::open(config, ctx.sink.clone())
        .with_context(|| format!("opening sitemap family '{name}'"))?;

    let mut shutdown = ctx.shutdown.clone();
    builder
        .run(&mut shutdown)
        .await
        .with_context(|| format!("sitemap family '{name}' failed"))?;

    let stats = builder.stats();
    tracing::info!(
        family = %name,
        entries = stats.entries_written,
        commits = stats.commits,
        shards_created = stats.shards_created,
        "family finished"
    );
    Ok(())
}

/// Every stream and family as its own task. The first failure stops the rest.
async fn cmd_run(ctx: AppContext, config: &AppConfig) -> Result<()> {
    if config.streams.is_empty() && config.sitemaps.is_empty() {
        anyhow::bail!("nothing to run: no streams or sitemaps configured");
    }

    let mut tasks = JoinSet::new();
    for stream in &config.streams {
        let label = format!("stream {}", stream.entity);
        let fut = run_stream(ctx.clone(), stream.clone());
        tasks.spawn(async move { (label, fut.await) });
    }
    for family in &config.sitemaps {
        let label = format!("family {}", family.name);
        let fut = run_family(ctx.clone(), family.clone());
        tasks.spawn(async move { (label, fut.await) });
    }

    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let (label, result) = match joined {
            Ok(done) => done,
            Err(e) => ("task".to_string(), Err(anyhow!("task panicked: {e}"))),
        };
        match result {
            Ok(()) => tracing::info!(task = %label, "task exited"),
            Err(e) => {
                let error = format!("{e:#}");
                tracing::error!(task = %label, %error, "task failed, stopping the rest");
                ctx.trigger.trigger();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ─── Inspection ──────────────────────────────────────────────────────────────

fn cmd_status(config: &AppConfig) -> Result<()> {
    let mut streams = Vec::new();
    for stream in &config.streams {
        let checkpoint = read_checkpoint(&stream.checkpoint_path)
            .with_context(|| format!("reading {} checkpoint", stream.entity))?;
        streams.push(json!({
            "entity": stream.entity,
            "checkpoint_path": stream.checkpoint_path,
            "checkpoint": checkpoint,
        }));
    }

    let mut families = Vec::new();
    for family in &config.sitemaps {
        families.push(family_status(family)?);
    }

    let report = json!({ "streams": streams, "sitemaps": families });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn family_status(family: &SitemapConfig) -> Result<Value> {
    let state = ShardIndexState::read(&family.state_path)
        .with_context(|| format!("reading state of family '{}'", family.name))?;

    let mut shards = Vec::new();
    for shard in family.layout().list_shards()? {
        let validity = validate_shard(&shard.path)?;
        shards.push(json!({
            "index": shard.index,
            "name": shard.name,
            "entries": validity.entries,
            "valid": validity.is_valid(),
        }));
    }

    Ok(json!({
        "name": family.name,
        "entity": family.entity,
        "state": state,
        "shards": shards,
    }))
}

fn cmd_rebuild_index(family: &SitemapConfig) -> Result<()> {
    let listed = rebuild_root_index(
        &family.root_index_path,
        &family.layout(),
        &family.shard_base_url,
        &family.extra_index_locs,
    )
    .with_context(|| format!("rebuilding root index of family '{}'", family.name))?;
    println!(
        "{}: {} locations written to {}",
        family.name,
        listed,
        family.root_index_path.display()
    );
    Ok(())
}

fn cmd_info(config: &AppConfig, path: &std::path::Path) -> Result<()> {
    println!("ChainArchive v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Config:   {}", path.display());
    println!("Node:     {}", config.rpc.url);
    println!();
    println!("Streams:");
    if config.streams.is_empty() {
        println!("  (none)");
    }
    for s in &config.streams {
        println!(
            "  {:<10} {}  segment_size={} finality_lag={}",
            s.entity.as_str(),
            s.output_dir.display(),
            s.segment_size,
            s.finality_lag
        );
    }
    println!();
    println!("Sitemap families:");
    if config.sitemaps.is_empty() {
        println!("  (none)");
    }
    for f in &config.sitemaps {
        println!(
            "  {:<10} {} -> {}  max_urls={}",
            f.name,
            f.entity.as_str(),
            f.root_index_path.display(),
            f.max_urls_per_shard
        );
    }
    Ok(())
}
