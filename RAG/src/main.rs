// Builds the vector store on first run, or loads it if it already exists,
// then reports its size. The chat server lives in ../api.

use anyhow::Result;
use rag_agent::{Config, VectorStoreAccessor};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    let accessor = VectorStoreAccessor::from_config(&config)?;
    let store = accessor.get_vectorstore().await?;

    println!(
        "Collection '{}' in {} holds {} chunks",
        store.name(),
        config.persist_dir.display(),
        store.count().await
    );
    Ok(())
}
