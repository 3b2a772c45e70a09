use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use upload_queue::{
    AppConfig, AppState, BroadcastNotifier, FsAssetResolver, LocalObjectStore, UploadQueue,
    routes,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-queue with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let connect = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("invalid database url {}", cfg.database_url))?
        .create_if_missing(true);
    if let Some(parent) = connect.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect)
            .await?,
    );

    let store = LocalObjectStore::new(db, cfg.storage_dir.clone(), cfg.public_url.clone());

    // --- Handle migration mode ---
    store.migrate().await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Drop sessions left behind by a previous run ---
    match store.purge_sessions_before(chrono::Utc::now()).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!("Removed {} unfinished upload session(s)", removed),
        Err(err) => tracing::warn!("could not clean up unfinished upload sessions: {}", err),
    }

    // --- Initialize the queue ---
    let resolver = match &cfg.asset_root {
        Some(root) => FsAssetResolver::with_root(root),
        None => FsAssetResolver::new(),
    };
    let notifier = BroadcastNotifier::default();
    let queue = UploadQueue::new(
        Arc::new(store.clone()),
        Arc::new(resolver),
        Arc::new(notifier.clone()),
        cfg.queue.clone(),
    );

    // --- Build router ---
    let shutdown = CancellationToken::new();
    let app: Router = routes::routes::routes().with_state(AppState {
        queue: queue.clone(),
        store,
        notifier,
        shutdown: shutdown.clone(),
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    // Let batches that are already running settle before exiting.
    let reports = queue.shutdown().await;
    tracing::info!("Server stopped; {} batch(es) settled during shutdown", reports.len());

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
