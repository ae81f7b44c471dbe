use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;

use feedsieve::api::create_router;
use feedsieve::config::Config;
use feedsieve::feed::Fetcher;
use feedsieve::processor::FeedProcessor;
use feedsieve::scheduler::Scheduler;
use feedsieve::service::FeedService;
use feedsieve::sources::{SourceCatalog, SourceSet};
use feedsieve::storage::{Database, Store};

#[derive(Parser, Debug)]
#[command(
    name = "feedsieve",
    version,
    about = "Feed-ingestion proxy: fetch, deduplicate, filter and re-serve RSS/Atom sources"
)]
struct Args {
    /// Path to the configuration file
    #[arg(long, value_name = "FILE", default_value = "feedsieve.toml")]
    config: PathBuf,

    /// Sources file, overriding `sources_path` from the config
    #[arg(long, value_name = "FILE")]
    sources: Option<PathBuf>,

    /// Fetch every enabled source once and exit
    #[arg(long, conflicts_with = "check")]
    once: bool,

    /// Validate the config and sources files and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;
    if let Some(path) = args.sources {
        config.sources_path = path;
    }
    let policy = config.fetch.host_policy();

    if args.check {
        let set = SourceSet::load(&config.sources_path, policy).with_context(|| {
            format!("Invalid sources file '{}'", config.sources_path.display())
        })?;
        println!(
            "OK: {} sources ({} enabled) in {}",
            set.len(),
            set.enabled_count(),
            config.sources_path.display()
        );
        return Ok(());
    }

    let catalog = Arc::new(
        SourceCatalog::from_file(&config.sources_path, policy).with_context(|| {
            format!(
                "Failed to load sources file '{}'",
                config.sources_path.display()
            )
        })?,
    );

    let db_path = config.database_path.to_string_lossy().into_owned();
    let store: Arc<dyn Store> = Arc::new(
        Database::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database '{}'", db_path))?,
    );

    let fetcher = Fetcher::new(&config.fetch).context("Failed to build HTTP client")?;
    let processor = Arc::new(FeedProcessor::new(fetcher, Arc::clone(&store)));
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&catalog),
        processor.clone(),
    ));
    let service = Arc::new(FeedService::new(
        Arc::clone(&store),
        Arc::clone(&catalog),
        Arc::clone(&scheduler),
        Arc::clone(&processor),
        config.serve.clone(),
    ));

    service
        .register_sources(&catalog.snapshot())
        .await
        .context("Failed to register sources")?;

    if args.once {
        let outcomes = scheduler.run_all_once().await;
        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        let new: usize = outcomes.iter().map(|o| o.new).sum();
        tracing::info!(sources = outcomes.len(), new, failed, "One-shot run complete");
        if failed > 0 {
            anyhow::bail!("{} of {} sources failed", failed, outcomes.len());
        }
        return Ok(());
    }

    scheduler.start().context("Failed to start scheduler")?;

    let admin_token = config.server.admin_token.clone().map(SecretString::from);
    if admin_token.is_none() {
        tracing::warn!("No admin token configured, admin routes are disabled");
    }
    let router = create_router(Arc::clone(&service), admin_token);

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    tracing::info!(listen = %config.server.listen, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
