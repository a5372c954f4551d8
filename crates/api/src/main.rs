//! HRIS Billing API Server

use hris_api::{create_router, AppState, Config};
use hris_billing::BillingService;
use hris_shared::{create_pool, run_migrations, DatabaseConfig};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hris_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting HRIS billing API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let db_config = DatabaseConfig::from_env()
        .map_err(|e| anyhow::anyhow!("DATABASE_URL must be set: {e}"))?;

    let pool = create_pool(&db_config).await?;
    run_migrations(&pool).await?;

    let billing = BillingService::from_env(pool)?;
    tracing::info!("Billing service initialized");

    let app = create_router(AppState::new(billing)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(config.request_timeout)),
    );

    tracing::info!("Starting server on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
