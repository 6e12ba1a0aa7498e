use std::sync::Arc;

use onboarding_engine::config::EngineConfig;
use onboarding_engine::onboarding::{
    Autosaver, DependencyGraph, OnboardingManager, OnboardingRouteState, onboarding_routes,
};
use onboarding_engine::store::{BlobStore, Database, LibSqlBackend, LocalBlobStore};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env()?;

    eprintln!("Onboarding engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   REST: http://0.0.0.0:{}/api/tenants", config.port);
    eprintln!("   WS:   ws://0.0.0.0:{}/ws/tenants/{{id}}", config.port);

    // ── Storage ──────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    eprintln!("   Database: {}", config.db_path.display());

    tokio::fs::create_dir_all(&config.blob_dir).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.blob_dir.clone()));
    eprintln!("   Blobs: {}", config.blob_dir.display());

    // ── Onboarding ───────────────────────────────────────────────────────
    let manager = Arc::new(OnboardingManager::new(
        db,
        blobs,
        DependencyGraph::default(),
        config.step_timings,
    ));
    let autosaver = Autosaver::new(Arc::clone(&manager), config.autosave_debounce);

    let app = onboarding_routes(OnboardingRouteState { manager, autosaver })
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Onboarding server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
