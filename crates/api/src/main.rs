use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kvdesk_api::config::ServerConfig;
use kvdesk_api::notifications::BulkEventForwarder;
use kvdesk_api::{background, router, state, ws};
use kvdesk_bulk::{BulkActionRegistry, BulkConfig};
use kvdesk_events::EventBus;
use kvdesk_store::StaticClientProvider;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kvdesk_api=debug,kvdesk_bulk=debug,kvdesk_store=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let bulk_config = BulkConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    tracing::info!(
        scan_count = bulk_config.scan_count,
        upload_batch_size = bulk_config.upload_batch_size,
        terminal_ttl_secs = bulk_config.terminal_ttl.as_secs(),
        "Loaded bulk action configuration"
    );

    // --- Databases ---
    let provider = StaticClientProvider::from_spec(&config.databases)
        .expect("KV_DATABASES must be a valid database list");
    tracing::info!(databases = ?provider.database_ids(), "Database catalogue loaded");

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager), heartbeat_cancel.clone());

    // --- Event bus + bulk engine ---
    let event_bus = Arc::new(EventBus::default());
    let reaper_ttl = bulk_config.terminal_ttl;
    let reaper_interval = bulk_config.reaper_interval;
    let registry = Arc::new(BulkActionRegistry::new(
        Arc::new(provider),
        Arc::clone(&event_bus),
        Arc::new(bulk_config),
    ));

    // Forward engine events to the owning WebSocket connections.
    let forwarder_cancel = CancellationToken::new();
    let forwarder_handle = tokio::spawn(
        BulkEventForwarder::new(Arc::clone(&ws_manager))
            .run(event_bus.subscribe(), forwarder_cancel.clone()),
    );

    // Evict terminal actions after their TTL.
    let reaper_cancel = CancellationToken::new();
    let reaper_handle = tokio::spawn(background::reaper::run(
        Arc::clone(&registry),
        reaper_ttl,
        reaper_interval,
        reaper_cancel.clone(),
    ));

    tracing::info!("Background services started (event forwarder, reaper, heartbeat)");

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        bulk_actions: Arc::clone(&registry),
    };

    let app = router::build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let grace = Duration::from_secs(config.shutdown_timeout_secs);

    let aborted = registry.abort_all().await;
    tracing::info!(aborted, "Aborted running bulk actions");

    reaper_cancel.cancel();
    let _ = tokio::time::timeout(grace, reaper_handle).await;

    // Let the terminal events of the aborted actions drain before the
    // connections go away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    forwarder_cancel.cancel();
    let _ = tokio::time::timeout(grace, forwarder_handle).await;
    tracing::info!("Event forwarder stopped");

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_cancel.cancel();
    let _ = tokio::time::timeout(grace, heartbeat_handle).await;

    tracing::info!("Graceful shutdown complete");
}

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
