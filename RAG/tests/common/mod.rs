#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use rag_agent::document_processor::{DocumentSource, TextSplitter};
use rag_agent::embedding_service::Embedder;
use rag_agent::models::{DocumentMetadata, SourceDocument};
use rag_agent::VectorStoreAccessor;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const DIMS: usize = 64;

/// Bag-of-words vectors: each lowercase word bumps one hashed bucket.
#[derive(Default)]
pub struct HashEmbedder {
    pub document_calls: AtomicUsize,
    pub fail_queries: AtomicBool,
}

impl HashEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() as usize) % DIMS] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            anyhow::bail!("embedding service unavailable");
        }
        Ok(Self::vector(text))
    }
}

/// Serves fixed documents and counts how often it was asked.
pub struct StaticSource {
    pub documents: Vec<SourceDocument>,
    pub loads: AtomicUsize,
    pub fail: AtomicBool,
}

impl StaticSource {
    pub fn new(documents: Vec<SourceDocument>) -> Self {
        Self {
            documents,
            loads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for StaticSource {
    async fn load(&self) -> Result<Vec<SourceDocument>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // give concurrent callers a chance to race
        tokio::task::yield_now().await;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("source unreachable");
        }
        Ok(self.documents.clone())
    }
}

pub fn knowledge_base() -> Vec<SourceDocument> {
    vec![
        SourceDocument {
            text: "Rust ownership rules make memory safety checkable at compile time. \
                   Borrowing lets code use values without taking ownership."
                .to_string(),
            metadata: DocumentMetadata {
                title: Some("Ownership".into()),
                source: Some("https://example.com/rust/ownership".into()),
                ..Default::default()
            },
        },
        SourceDocument {
            text: "Tomatoes need full sun and regular watering. \
                   Gardening in raised beds keeps the soil warm."
                .to_string(),
            metadata: DocumentMetadata {
                source: Some("https://example.com/garden".into()),
                ..Default::default()
            },
        },
        SourceDocument {
            text: "Vector stores keep embeddings for similarity search. \
                   A retriever returns the nearest documents for a query."
                .to_string(),
            metadata: DocumentMetadata::default(),
        },
    ]
}

pub fn accessor(
    dir: &Path,
    embedder: Arc<HashEmbedder>,
    source: Arc<StaticSource>,
) -> VectorStoreAccessor {
    VectorStoreAccessor::new(
        dir,
        "docs",
        embedder,
        source,
        TextSplitter::new(1000, 200).unwrap(),
    )
}
