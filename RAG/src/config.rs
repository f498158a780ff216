use anyhow::Result;
use std::env;
use std::path::PathBuf;

/// Characters per chunk when splitting source documents.
pub const CHUNK_SIZE: usize = 1000;
/// Characters shared between consecutive chunks.
pub const CHUNK_OVERLAP: usize = 200;
/// Documents returned by one retrieval call.
pub const RETRIEVE_TOP_K: usize = 2;
pub const SNIPPET_MAX_CHARS: usize = 500;
/// Model calls allowed in one agent run.
pub const MAX_AGENT_STEPS: usize = 12;

pub const DEFAULT_SOURCE_URL: &str =
    "https://docs.langchain.com/oss/python/langchain/knowledge-base";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub persist_dir: PathBuf,
    pub collection_name: String,
    pub embedding_model: String,
    pub ollama_base_url: String,
    pub chat_model: String,
    pub deepseek_api_key: String,
    pub deepseek_base_url: String,
    /// sqlite connection string (`sqlite:` scheme) for durable checkpoints;
    /// in-memory when unset.
    pub db_uri: Option<String>,
    pub source_urls: Vec<String>,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let deepseek_api_key = get("DEEPSEEK_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("DEEPSEEK_API_KEY environment variable not set"))?;

        let source_urls: Vec<String> = or("SOURCE_URLS", DEFAULT_SOURCE_URL)
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if source_urls.is_empty() {
            anyhow::bail!("SOURCE_URLS must name at least one URL");
        }

        let db_uri = get("DB_URI");
        if let Some(uri) = &db_uri {
            if !uri.trim_start().starts_with("sqlite:") {
                anyhow::bail!(
                    "DB_URI must be a sqlite connection string (sqlite:...), got {:?}",
                    uri.split(':').next().unwrap_or_default()
                );
            }
        }

        Ok(Self {
            persist_dir: PathBuf::from(or("VECTORSTORE_PERSIST_DIR", "./vectorstore")),
            collection_name: or("DOCS_INDEX_NAME", "docs"),
            embedding_model: or("OLLAMA_EMBEDDING_MODEL", "qwen3-embedding:4b"),
            ollama_base_url: or("OLLAMA_BASE_URL", "http://localhost:11434"),
            chat_model: or("CHAT_MODEL", "deepseek-chat"),
            deepseek_api_key,
            deepseek_base_url: or("DEEPSEEK_BASE_URL", "https://api.deepseek.com"),
            db_uri,
            source_urls,
            bind_addr: or("BIND_ADDR", "127.0.0.1:8000"),
        })
    }
}
