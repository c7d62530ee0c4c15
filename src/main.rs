mod config;
mod credential;
mod error;
mod models;
mod routes;
mod run;
mod services;
mod utils;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = config::Config::from_env().context("failed to read configuration")?;
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;
    tracing::info!(
        "Using {:?} model {} at {}, writing to {}",
        config.llm.provider,
        config.llm.model,
        config.llm.api_url,
        config.output_dir.display()
    );

    let bind_addr = config.bind_addr.clone();
    let app = routes::build_router(routes::AppState::new(config));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
