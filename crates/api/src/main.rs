//! Chatrelay API server entry point

use anyhow::Context;
use redis::aio::ConnectionManager;
use tracing_subscriber::EnvFilter;

use chatrelay_api::{routes, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = chatrelay_shared::db::create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    chatrelay_shared::db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool, redis);
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %bind_address, "chat relay listening");

    axum::serve(listener, app)
        .await
        .context("server terminated")?;

    Ok(())
}
