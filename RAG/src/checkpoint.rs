use crate::models::{AgentState, Message};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;

/// Conversation state per thread id.
///
/// History is append-only: a run adds its input and every message it
/// produces, nothing is rewritten.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// State of `thread_id`, empty for a thread never seen before.
    async fn load(&self, thread_id: &str) -> Result<AgentState>;

    async fn append(&self, thread_id: &str, messages: &[Message]) -> Result<()>;
}

/// Lives as long as the process.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    threads: RwLock<HashMap<String, AgentState>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointer {
    async fn load(&self, thread_id: &str) -> Result<AgentState> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, thread_id: &str, messages: &[Message]) -> Result<()> {
        self.threads
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .messages
            .extend_from_slice(messages);
        Ok(())
    }
}

/// Durable checkpoints in sqlite, one row per message.
pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl SqliteCheckpointer {
    pub async fn connect(uri: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(uri)
            .with_context(|| format!("invalid DB_URI {}", uri))?
            .create_if_missing(true);

        // Every connection to an in-memory database gets its own database,
        // so keep exactly one open for the life of the pool.
        let pool_options = if uri.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open checkpoint database {}", uri))?;

        let checkpointer = Self { pool };
        checkpointer.setup().await?;
        Ok(checkpointer)
    }

    async fn setup(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoint_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoint_messages_thread
                ON checkpoint_messages (thread_id, id)",
        )
        .execute(&self.pool)
        .await?;

        log::info!("Checkpoint tables ready");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointer {
    async fn load(&self, thread_id: &str) -> Result<AgentState> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM checkpoint_messages WHERE thread_id = ? ORDER BY id",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|(payload,)| {
                serde_json::from_str::<Message>(&payload)
                    .with_context(|| format!("corrupt checkpoint row for thread {}", thread_id))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AgentState { messages })
    }

    async fn append(&self, thread_id: &str, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query("INSERT INTO checkpoint_messages (thread_id, payload) VALUES (?, ?)")
                .bind(thread_id)
                .bind(serde_json::to_string(message)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
