pub mod agent;
pub mod chat_model;
pub mod checkpoint;
pub mod citations;
pub mod config;
pub mod document_processor;
pub mod embedding_service;
pub mod models;
pub mod prompts;
pub mod tools;
pub mod vector_store;

pub use agent::{get_or_create_agent, Agent, AgentError, AgentEvent, ContentBlock, Node, RunConfig};
pub use config::Config;
pub use models::*;
pub use tools::RetrievalTool;
pub use vector_store::{VectorStore, VectorStoreAccessor};
