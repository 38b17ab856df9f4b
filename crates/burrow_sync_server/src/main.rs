use std::sync::Arc;

use axum::{routing::get, Router};
use burrow_sync_server::{
    auth::DbTokenVerifier,
    backup::BackupScheduler,
    config::Config,
    db::{init_database, PermissionStore},
    handlers::ws::{ws_handler, WsState},
    store::VaultStore,
    sync::{DocRegistry, SyncEngine},
};
use rusqlite::Connection;
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burrow_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Burrow Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);
    info!("Data root: {:?}", config.data_root);

    // Initialize database
    let conn = match Connection::open(&config.database_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = init_database(&conn) {
        error!("Failed to initialize database: {}", e);
        std::process::exit(1);
    }

    // Open the vault store
    let store = match VaultStore::open(config.vaults_dir()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open data root: {}", e);
            std::process::exit(1);
        }
    };

    // Create shared state
    let perms = PermissionStore::new(conn);
    let verifier = Arc::new(DbTokenVerifier::new(perms.shared_conn()));
    let registry = Arc::new(DocRegistry::new(store, config.file_debounce));
    let engine = Arc::new(SyncEngine::new(
        registry.clone(),
        perms.clone(),
        config.join_pacing,
    ));
    let backups = BackupScheduler::new(config.vaults_dir(), config.backups_dir());

    let ws_state = WsState {
        engine: engine.clone(),
        verifier,
        auth_timeout: config.auth_timeout,
    };

    // Build CORS layer
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new().allow_origin(AllowOrigin::list(origins));

    // Build the router
    let app = Router::new()
        .route("/", get(|| async { "Burrow Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        .route("/sync", get(ws_handler))
        .with_state(ws_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Autosave task: flush dirty vaults on an interval
    {
        let registry = registry.clone();
        let autosave = config.autosave_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(autosave);
            loop {
                interval.tick().await;
                registry.flush_dirty().await;
            }
        });
    }

    // Backup task: hourly snapshots with retention pruning
    {
        let backups = backups.clone();
        let backup_interval = config.backup_interval;
        info!("Backup interval: {:?}", backup_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(backup_interval);
            // The first tick fires immediately; skip it so a restart does not
            // double up on snapshots.
            interval.tick().await;
            loop {
                interval.tick().await;
                let scheduler = backups.clone();
                let result = tokio::task::spawn_blocking(move || scheduler.run_once()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Backup run failed: {}", e),
                    Err(e) => error!("Backup task panicked: {}", e),
                }
            }
        });
    }

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Flush all live vaults before exit
    registry.shutdown().await;
    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
