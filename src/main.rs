use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use indexcache::storage::s3::S3IndexStorage;
use indexcache::storage::IndexStorageClient;
use indexcache::{config, server, TableManager};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "indexcache", about = "Local index table cache daemon")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/indexcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_client(s3_cfg: &config::S3StorageConfig) -> aws_sdk_s3::Client {
    let mut loader = aws_config::from_env();
    loader = loader.region(aws_config::Region::new(s3_cfg.region.clone()));
    if s3_cfg.use_fips {
        loader = loader.use_fips(true);
    }

    let shared = loader.load().await;
    let client = aws_sdk_s3::Client::from_conf(
        aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build(),
    );

    tracing::info!(
        region = %s3_cfg.region,
        bucket = %s3_cfg.bucket,
        prefix = %s3_cfg.prefix,
        "index storage backed by S3"
    );
    client
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Resolves once the process is asked to stop (SIGINT, or SIGTERM on unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupt received, shutting down");
                    }
                    _ = term.recv() => {
                        tracing::info!("termination requested, shutting down");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "SIGTERM handler unavailable, watching interrupts only");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("interrupt received, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, shutting down");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting indexcache");

    // ---- Storage client ----
    let s3 = build_s3_client(&config.storage.s3).await;
    let storage: Arc<dyn IndexStorageClient> = Arc::new(S3IndexStorage::new(
        s3,
        config.storage.s3.bucket.clone(),
        config.storage.s3.prefix.clone(),
    ));

    // ---- Table manager ----
    let mut registry = Registry::default();
    let manager = TableManager::new(
        config.table_manager_config(),
        Arc::new(indexcache::open_raw_index_file),
        Arc::clone(&storage),
        Arc::new(config.limits.clone()),
        None,
        &mut registry,
    )
    .await
    .context("start table manager")?;

    // ---- Admin server ----
    let state = Arc::new(server::ServerState {
        registry,
        storage: Arc::clone(&storage),
        cache_dir: config.cache_dir.clone(),
    });
    let app = server::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.http_listen)
        .await
        .with_context(|| format!("bind admin listener on {}", config.server.http_listen))?;
    tracing::info!(listen_addr = %config.server.http_listen, "admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server error")?;

    // ---- Shutdown ----
    manager.stop().await;
    tracing::info!("indexcache shut down cleanly");
    Ok(())
}
