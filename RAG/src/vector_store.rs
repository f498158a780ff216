//! Persisted embedding collection and the process-wide accessor that opens
//! or builds it.
//!
//! A collection lives in `<persist_dir>/<name>.json`. It is written once,
//! when the directory is first populated, and only read afterwards.

use crate::config::{Config, CHUNK_OVERLAP, CHUNK_SIZE};
use crate::document_processor::{DocumentSource, TextSplitter, WebDocumentSource};
use crate::embedding_service::{cosine_similarity, Embedder, OllamaEmbedder};
use crate::models::*;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    text: String,
    metadata: DocumentMetadata,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct PersistedCollection {
    name: String,
    embedding_model: String,
    records: Vec<StoredRecord>,
}

#[derive(Serialize)]
struct PersistedCollectionRef<'a> {
    name: &'a str,
    embedding_model: &'a str,
    records: &'a [StoredRecord],
}

pub struct VectorStore {
    name: String,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    records: RwLock<Vec<StoredRecord>>,
}

impl fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("records", &self.records.try_read().map(|r| r.len()).ok())
            .finish()
    }
}

impl VectorStore {
    /// Open the named collection under `persist_dir`, empty if it has never
    /// been written.
    pub async fn open(persist_dir: &Path, name: &str, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = collection_path(persist_dir, name);

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let collection: PersistedCollection = serde_json::from_slice(&bytes)
                    .with_context(|| format!("malformed collection file {}", path.display()))?;
                if collection.name != name {
                    log::warn!(
                        "Collection file {} names '{}', expected '{}'",
                        path.display(),
                        collection.name,
                        name
                    );
                }
                if collection.embedding_model != embedder.model_name() {
                    log::warn!(
                        "Collection '{}' was embedded with '{}' but queries use '{}'",
                        name,
                        collection.embedding_model,
                        embedder.model_name()
                    );
                }
                collection.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        Ok(Self {
            name: name.to_string(),
            path,
            embedder,
            records: RwLock::new(records),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Embed and append chunks, then rewrite the collection file.
    pub async fn add_documents(&self, chunks: Vec<DocumentChunk>) -> Result<usize> {
        let mut new_records = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_documents(&texts).await?;
            anyhow::ensure!(
                vectors.len() == batch.len(),
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            );

            for (chunk, embedding) in batch.iter().zip(vectors) {
                new_records.push(StoredRecord {
                    id: Uuid::new_v4().to_string(),
                    text: chunk.text.clone(),
                    metadata: chunk.metadata.clone(),
                    embedding,
                });
            }
        }

        let added = new_records.len();
        let mut records = self.records.write().await;
        records.extend(new_records);
        self.persist(&records).await?;

        log::info!("Added {} chunks to collection '{}'", added, self.name);
        Ok(added)
    }

    /// Top `k` records by cosine similarity to `query`, most similar first.
    pub async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed_query(query).await?;
        let records = self.records.read().await;

        if let Some(first) = records.first() {
            anyhow::ensure!(
                first.embedding.len() == query_embedding.len(),
                "query embedding has {} dimensions, collection '{}' has {}",
                query_embedding.len(),
                self.name,
                first.embedding.len()
            );
        }

        let mut scored: Vec<(usize, f32)> = records
            .par_iter()
            .enumerate()
            .map(|(idx, record)| (idx, cosine_similarity(&query_embedding, &record.embedding)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let hits: Vec<RetrievedDocument> = scored
            .into_iter()
            .take(k)
            .map(|(idx, score)| RetrievedDocument {
                text: records[idx].text.clone(),
                metadata: records[idx].metadata.clone(),
                score,
            })
            .collect();

        log::debug!("Found {} relevant chunks in '{}'", hits.len(), self.name);
        Ok(hits)
    }

    async fn persist(&self, records: &[StoredRecord]) -> Result<()> {
        let collection = PersistedCollectionRef {
            name: &self.name,
            embedding_model: self.embedder.model_name(),
            records,
        };
        let bytes = serde_json::to_vec(&collection)?;

        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to move collection into {}", self.path.display()))?;
        Ok(())
    }
}

fn collection_path(persist_dir: &Path, name: &str) -> PathBuf {
    persist_dir.join(format!("{}.json", name))
}

fn temp_path(collection: &Path) -> PathBuf {
    collection.with_extension("json.tmp")
}

/// Leftover of a write that never reached its rename.
async fn remove_stale_temp(collection: &Path) -> Result<()> {
    let tmp = temp_path(collection);
    match tokio::fs::remove_file(&tmp).await {
        Ok(()) => {
            log::warn!("Removed unfinished collection write {}", tmp.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", tmp.display())),
    }
}

/// Opens the collection once per process, building it on first run.
pub struct VectorStoreAccessor {
    persist_dir: PathBuf,
    collection_name: String,
    embedder: Arc<dyn Embedder>,
    source: Arc<dyn DocumentSource>,
    splitter: TextSplitter,
    store: OnceCell<Arc<VectorStore>>,
}

impl VectorStoreAccessor {
    pub fn new(
        persist_dir: impl Into<PathBuf>,
        collection_name: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        source: Arc<dyn DocumentSource>,
        splitter: TextSplitter,
    ) -> Self {
        Self {
            persist_dir: persist_dir.into(),
            collection_name: collection_name.into(),
            embedder,
            source,
            splitter,
            store: OnceCell::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = OllamaEmbedder::new(&config.ollama_base_url, &config.embedding_model)?;
        let source = WebDocumentSource::new(config.source_urls.clone())?;

        Ok(Self::new(
            config.persist_dir.clone(),
            config.collection_name.clone(),
            Arc::new(embedder),
            Arc::new(source),
            TextSplitter::new(CHUNK_SIZE, CHUNK_OVERLAP)?,
        ))
    }

    /// The opened store. Concurrent first callers share one initialization;
    /// a failed initialization is retried by the next caller.
    pub async fn get_vectorstore(&self) -> Result<Arc<VectorStore>> {
        self.store
            .get_or_try_init(|| self.open_or_create())
            .await
            .map(Arc::clone)
    }

    async fn open_or_create(&self) -> Result<Arc<VectorStore>> {
        let path = collection_path(&self.persist_dir, &self.collection_name);

        // Populated means the collection file itself holds records; other
        // files in the directory do not count.
        if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to inspect {}", path.display()))?
        {
            log::info!("Found existing vector store at {}, loading", path.display());
            let store =
                VectorStore::open(&self.persist_dir, &self.collection_name, self.embedder.clone()).await?;
            let count = store.count().await;
            if count > 0 {
                log::info!("Vector store loaded, {} documents", count);
                return Ok(Arc::new(store));
            }
            log::warn!("Collection file {} holds no records, rebuilding", path.display());
        }

        log::info!("No vector store at {}, creating", self.persist_dir.display());
        tokio::fs::create_dir_all(&self.persist_dir)
            .await
            .with_context(|| format!("failed to create {}", self.persist_dir.display()))?;
        remove_stale_temp(&path).await?;

        let documents = self
            .source
            .load()
            .await
            .context("failed to load source documents")?;
        anyhow::ensure!(!documents.is_empty(), "document source returned no documents");

        let chunks = self.splitter.split_documents(&documents);
        anyhow::ensure!(!chunks.is_empty(), "source documents produced no chunks");

        let store =
            VectorStore::open(&self.persist_dir, &self.collection_name, self.embedder.clone()).await?;
        store.add_documents(chunks).await?;

        log::info!("Vector store created with {} documents", store.count().await);
        Ok(Arc::new(store))
    }
}
