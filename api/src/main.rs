mod chat_request;
mod routes;

use anyhow::{Context, Result};
use rag_agent::{get_or_create_agent, Config, VectorStoreAccessor};
use routes::{router, AppState};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment variables and logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;

    // Build or load the vector store before accepting requests
    let accessor = Arc::new(VectorStoreAccessor::from_config(&config)?);
    let store = accessor
        .get_vectorstore()
        .await
        .context("failed to initialize vector store")?;
    log::info!("Vector store '{}' ready with {} chunks", store.name(), store.count().await);

    let agent = get_or_create_agent(&config, accessor).await?;
    let app = router(AppState { agent });

    let listener = tokio::net::TcpListener::bind(config.bind_addr.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    log::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
