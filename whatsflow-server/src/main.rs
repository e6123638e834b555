use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use whatsflow_core::config::StoreBackend;
use whatsflow_core::{MemoryStore, PgSessionStore, SessionStore, WhatsflowConfig};
use whatsflow_server::http::{start_http_server, HttpState};
use whatsflow_server::subsystems::run_exit_monitor;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "whatsflow.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

async fn open_store(config: &WhatsflowConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; sessions are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let pool = whatsflow_core::db::create_pool(&config.database).await?;
            whatsflow_core::db::ensure_schema(&pool).await?;
            Ok(Arc::new(PgSessionStore::new(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match WhatsflowConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let store = match open_store(&config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open {:?} store: {}", config.store.backend, e);
            std::process::exit(1);
        }
    };

    if args.health {
        match store.health().await {
            Ok(v) => println!("✅ Store ({}) reachable: {}", store.name(), v),
            Err(e) => {
                println!("❌ Store ({}) check failed: {}", store.name(), e);
                std::process::exit(1);
            }
        }
        println!("✅ Whatsflow health check passed");
        return Ok(());
    }

    let (state, exits) = HttpState::build(store, &config)?;

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Crash feedback from connector processes
    tokio::spawn(run_exit_monitor(
        exits,
        state.registry.clone(),
        tx.subscribe(),
    ));

    let supervisor = state.supervisor.clone();
    let result = start_http_server(state, config.http.clone(), tx.subscribe()).await;

    supervisor.shutdown().await;
    result
}
