//! trackhub - GPS/telemetry tracking server
//!
//! Main entry point: wires the device directory, permissions, group
//! registry and connection manager, then serves the tracker ingress and
//! the HTTP/WebSocket API.

use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trackhub::connection_manager::{Collaborators, ConnectionManager, ConnectionSettings, HotDeviceSet};
use trackhub::device_directory::MySqlDeviceDirectory;
use trackhub::group_registry::{GroupService, MySqlGroupRepository};
use trackhub::ingress::TrackerIngress;
use trackhub::permissions::MySqlPermissionResolver;
use trackhub::state::{AppConfig, AppState};
use trackhub::status_events::{EventBroadcaster, MotionEvaluator, OverspeedEvaluator};
use trackhub::web_api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trackhub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting trackhub v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        port = config.port,
        ingress_port = config.ingress_port,
        status_timeout_secs = config.status_timeout_secs,
        register_unknown = config.register_unknown,
        "Configuration loaded"
    );

    // Create database pool
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connected");

    // Initialize collaborators
    let directory = Arc::new(MySqlDeviceDirectory::new(pool.clone()));
    let permissions = Arc::new(MySqlPermissionResolver::new(pool.clone()));
    let broadcaster = Arc::new(EventBroadcaster::new(permissions.clone()));
    let hot_devices = Arc::new(HotDeviceSet::new());

    // Connection manager
    let connections = ConnectionManager::new(
        ConnectionSettings {
            device_timeout: config.device_timeout(),
            update_device_state: config.status_update_device_state,
            register_unknown: config.register_unknown,
        },
        Collaborators {
            directory: directory.clone(),
            permissions: permissions.clone(),
            notifications: broadcaster.clone(),
            device_cache: hot_devices.clone(),
        },
        MotionEvaluator::default(),
        OverspeedEvaluator::default(),
    );
    broadcaster.attach(&connections);
    tracing::info!("ConnectionManager initialized");

    // Group registry with warmed cache
    let groups = Arc::new(GroupService::new(Arc::new(MySqlGroupRepository::new(
        pool.clone(),
    ))));
    groups.refresh().await?;
    tracing::info!("GroupRegistry initialized");

    // Create application state
    let state = AppState {
        pool,
        config: config.clone(),
        connections: connections.clone(),
        directory,
        groups,
        permissions,
        hot_devices,
    };

    // Keepalive broadcast task
    let keepalive = connections.clone();
    let keepalive_interval = Duration::from_secs(config.keepalive_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(keepalive_interval);
        loop {
            interval.tick().await;
            keepalive.send_keepalive().await;
        }
    });

    // Tracker ingress
    let ingress = TrackerIngress::new(config.ingress_port, connections.clone());
    tokio::spawn(async move {
        if let Err(e) = ingress.run().await {
            tracing::error!(error = %e, "Tracker ingress stopped");
        }
    });

    // Create router
    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    state.connections.shutdown().await;

    Ok(())
}
