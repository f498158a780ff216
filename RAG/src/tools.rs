use crate::citations::format_citations;
use crate::config::RETRIEVE_TOP_K;
use crate::models::RetrieveResult;
use crate::vector_store::VectorStoreAccessor;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Function description handed to the chat model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Something the agent can call between model turns.
///
/// An `Err` is reported back to the model as the tool's output.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn invoke(&self, arguments: serde_json::Value) -> Result<String>;
}

pub const RETRIEVE_TOOL_NAME: &str = "retrieve_docs";

/// Looks up documents related to a query in the vector store.
pub struct RetrievalTool {
    accessor: Arc<VectorStoreAccessor>,
    top_k: usize,
}

impl RetrievalTool {
    pub fn new(accessor: Arc<VectorStoreAccessor>) -> Self {
        Self::with_top_k(accessor, RETRIEVE_TOP_K)
    }

    pub fn with_top_k(accessor: Arc<VectorStoreAccessor>, top_k: usize) -> Self {
        Self { accessor, top_k }
    }

    /// Never fails: problems end up in [`RetrieveResult::error`].
    pub async fn retrieve(&self, query: &str) -> RetrieveResult {
        match self.search(query).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Retrieval for {:?} failed: {:#}", query, e);
                RetrieveResult::failed(format!("{:#}", e))
            }
        }
    }

    async fn search(&self, query: &str) -> Result<RetrieveResult> {
        let store = self.accessor.get_vectorstore().await?;
        let docs = store.similarity_search(query, self.top_k).await?;
        log::debug!("Retrieved {} documents for {:?}", docs.len(), query);
        Ok(RetrieveResult::found(format_citations(&docs, self.top_k)))
    }
}

#[async_trait]
impl Tool for RetrievalTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: RETRIEVE_TOOL_NAME.to_string(),
            description: "Search the knowledge base for documents relevant to a query. \
                          Returns numbered citations with title, source and a snippet."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Free-text search query"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<String> {
        let query = arguments
            .get("query")
            .and_then(|q| q.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument 'query'"))?;

        Ok(self.retrieve(query).await.to_string())
    }
}
