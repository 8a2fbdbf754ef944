use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use homepedia_core::Source;
use homepedia_storage::{MemoryPropertyStore, PgPropertyStore};
use homepedia_sync::{run_sources, SourceRegistry, StoreTarget, SyncConfig, SyncOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "homepedia")]
#[command(about = "Homepedia real-estate ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the enabled sources and upsert their listings.
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// List the sources declared in sources.yaml.
    Sources,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Restrict the run to this source (repeatable).
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<Source>,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    page_size: Option<u32>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Run sources concurrently instead of one after the other.
    #[arg(long)]
    parallel: bool,
    /// Write to an in-memory store instead of PostgreSQL.
    #[arg(long)]
    dry_run: bool,
}

fn parse_source(raw: &str) -> Result<Source, String> {
    Source::parse(raw).ok_or_else(|| format!("unknown source {raw:?} (expected dvf, bienici or seloger)"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn,hyper=warn,reqwest=warn".into()),
        )
        .with(fmt::layer())
        .init();
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("shutdown requested, finishing current batch");
                token.cancel();
            }
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
    });
}

async fn sync(args: SyncArgs) -> Result<()> {
    let mut config = SyncConfig::from_env();
    if let Some(max_pages) = args.max_pages {
        config.max_pages = max_pages;
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }

    let registry = SourceRegistry::load(config.registry_path()).await?;
    let target = if args.dry_run {
        info!("dry run, writing to memory");
        StoreTarget::Memory(MemoryPropertyStore::new())
    } else {
        StoreTarget::Postgres {
            database_url: config.database_url.clone(),
            config: config.pg_store_config(),
            migrate: true,
        }
    };
    let options = SyncOptions {
        sources: args.sources,
        parallel: args.parallel,
    };

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let summary = run_sources(&config, &registry, &target, &options, shutdown).await?;
    for run in &summary.runs {
        println!(
            "sync complete: source={} reason={} total={} new={} updated={} failed={} rejected={} pages={} incomplete={}",
            run.source,
            run.reason,
            run.total_properties,
            run.new_properties,
            run.updated_properties,
            run.failed_writes,
            run.rejected_records,
            run.total_pages,
            run.incomplete_departments.len()
        );
    }

    if summary.store_failed() {
        bail!("store became unavailable during sync");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgPropertyStore::connect(&config.database_url, &config.pg_store_config())
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(config.registry_path()).await?;
            for source in &registry.sources {
                println!(
                    "{:<8} {:<8} {:<32} {}",
                    source.source,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.display_name,
                    source.base_url
                );
            }
        }
    }

    Ok(())
}
