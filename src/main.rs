// src/main.rs
use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use labor_ledger_core::aggregation::AggregationFilters;
use labor_ledger_core::api::{router, AppState, LedgerSettings};
use labor_ledger_core::clock::{Clock, SystemClock};
use labor_ledger_core::config::{AppConfig, Cli};
use labor_ledger_core::export::write_worker_csv;
use labor_ledger_core::local_store::{FileStorage, LocalStorage};
use labor_ledger_core::remote::{
    ImageStorage, InMemoryRemoteStore, RemoteConfig, RemoteRecordStore, RestRemoteStore,
};
use labor_ledger_core::views::{total_view, worker_view};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    config.apply_cli(&cli);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Storage & remote backend ---
    let storage: Arc<dyn LocalStorage> = Arc::new(
        FileStorage::new(&config.storage_dir).with_context(|| {
            format!("Failed to open storage directory {}", config.storage_dir.display())
        })?,
    );
    info!("Local cache at {}", config.storage_dir.display());

    let (remote, images): (Arc<dyn RemoteRecordStore>, Arc<dyn ImageStorage>) =
        match &config.remote_url {
            Some(url) => {
                let store = Arc::new(
                    RestRemoteStore::new(RemoteConfig {
                        base_url: url.clone(),
                        api_key: config.remote_api_key.clone(),
                        timeout_secs: config.remote_timeout_secs,
                    })
                    .context("Failed to create remote store client")?,
                );
                info!("Remote store at {}", url);
                let remote: Arc<dyn RemoteRecordStore> = store.clone();
                let images: Arc<dyn ImageStorage> = store;
                (remote, images)
            }
            None => {
                warn!("LEDGER_REMOTE_URL not set, using an in-process remote store");
                let store = Arc::new(InMemoryRemoteStore::new("http://localhost"));
                let remote: Arc<dyn RemoteRecordStore> = store.clone();
                let images: Arc<dyn ImageStorage> = store;
                (remote, images)
            }
        };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::build(storage, remote, images, clock, &LedgerSettings::from(&config));

    // --- One-shot export ---
    if let Some(project_id) = &cli.export_csv {
        let rows = state
            .engine
            .aggregate_fresh(&AggregationFilters::project(project_id));
        info!("Exporting {} workers of project {}", rows.len(), project_id);
        write_worker_csv(&worker_view(&rows), &total_view(&rows), std::io::stdout().lock())
            .context("Failed to write CSV export")?;
        return Ok(());
    }

    info!("{} mutations waiting in the sync queue", state.queue.len());

    let app = router(state).layer(TraceLayer::new_for_http());
    let addr = config.socket_addr()?;

    // --- Run Web Server ---
    match config.tls_paths()? {
        Some((cert, key)) => {
            let tls_config = RustlsConfig::from_pem_file(cert, key)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load TLS cert/key from {} and {}",
                        cert.display(),
                        key.display()
                    )
                })?;
            info!("Starting server on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Listening on http://{}", addr);
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
