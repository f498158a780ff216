//! Tool-using conversational agent.
//!
//! One run alternates model calls and tool calls until the model answers
//! without requesting a tool, streaming every increment to the caller as it
//! is produced. Conversation history is kept per thread id in a
//! [`CheckpointStore`].

use crate::chat_model::{ChatModel, DeepSeekChatModel, ModelDelta};
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointer, SqliteCheckpointer};
use crate::config::{Config, MAX_AGENT_STEPS};
use crate::models::*;
use crate::prompts::AGENT_PROMPT;
use crate::tools::{RetrievalTool, Tool, ToolSpec};
use crate::vector_store::VectorStoreAccessor;
use anyhow::Result;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0:#}")]
    Model(anyhow::Error),
    #[error("checkpoint store failed: {0:#}")]
    Checkpoint(anyhow::Error),
    #[error("no final answer after {0} model calls")]
    StepLimit(usize),
}

/// Which part of the run produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Model,
    Tools,
}

impl Node {
    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Model => "model",
            Node::Tools => "tools",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolCallChunk {
        name: Option<String>,
        arguments: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageChunk {
    pub content_blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMetadata {
    pub node: Node,
    /// 1-based model call this event belongs to.
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub chunk: MessageChunk,
    pub metadata: EventMetadata,
}

impl AgentEvent {
    fn new(node: Node, step: usize, block: ContentBlock) -> Self {
        Self {
            chunk: MessageChunk {
                content_blocks: vec![block],
            },
            metadata: EventMetadata { node, step },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunConfig {
    /// Runs without a thread id neither read nor write history.
    pub thread_id: Option<String>,
}

enum RunError {
    Agent(AgentError),
    /// The receiver went away; nobody is listening any more.
    Disconnected,
}

impl From<AgentError> for RunError {
    fn from(e: AgentError) -> Self {
        RunError::Agent(e)
    }
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Vec<Arc<dyn Tool>>,
    system_prompt: String,
    checkpointer: Arc<dyn CheckpointStore>,
    max_steps: usize,
    thread_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Vec<Arc<dyn Tool>>,
        system_prompt: impl Into<String>,
        checkpointer: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            model,
            tools,
            system_prompt: system_prompt.into(),
            checkpointer,
            max_steps: MAX_AGENT_STEPS,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Start a run and return its event stream.
    ///
    /// The run happens in its own task. A failure is delivered as the last
    /// item; the channel closes when the run ends. Dropping the receiver
    /// stops the run at its next event.
    pub fn stream(
        self: &Arc<Self>,
        input: Vec<Message>,
        config: RunConfig,
    ) -> mpsc::Receiver<Result<AgentEvent, AgentError>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let agent = Arc::clone(self);

        tokio::spawn(async move {
            match agent.run(input, &config, &tx).await {
                Ok(()) => {}
                Err(RunError::Disconnected) => {
                    log::debug!("Client went away, stopping run for {:?}", config.thread_id);
                }
                Err(RunError::Agent(e)) => {
                    log::error!("Agent run for {:?} failed: {}", config.thread_id, e);
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        rx
    }

    async fn run(
        &self,
        input: Vec<Message>,
        config: &RunConfig,
        tx: &mpsc::Sender<Result<AgentEvent, AgentError>>,
    ) -> Result<(), RunError> {
        // Same-thread runs queue up so each sees the other's full turn.
        let _guard = match &config.thread_id {
            Some(thread_id) => Some(self.thread_lock(thread_id).lock_owned().await),
            None => None,
        };

        let mut history = match &config.thread_id {
            Some(thread_id) => {
                self.checkpointer
                    .load(thread_id)
                    .await
                    .map_err(AgentError::Checkpoint)?
                    .messages
            }
            None => Vec::new(),
        };

        self.commit(config, &input).await?;
        history.extend(input);

        let specs: Vec<ToolSpec> = self.tools.iter().map(|tool| tool.spec()).collect();

        for step in 1..=self.max_steps {
            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(Message::system(self.system_prompt.as_str()));
            messages.extend(history.iter().cloned());

            let reply = self.call_model(step, &messages, &specs, tx).await?;

            if reply.tool_calls.is_empty() {
                self.commit(config, std::slice::from_ref(&reply)).await?;
                return Ok(());
            }

            let mut produced = Vec::with_capacity(reply.tool_calls.len() + 1);
            for call in &reply.tool_calls {
                let output = self.run_tool(call).await;
                self.emit(tx, AgentEvent::new(Node::Tools, step, ContentBlock::Text(output.clone())))
                    .await?;
                produced.push(Message::tool(call.id.as_str(), output));
            }
            produced.insert(0, reply);

            // An assistant turn is only stored together with its tool results.
            self.commit(config, &produced).await?;
            history.extend(produced);
        }

        Err(AgentError::StepLimit(self.max_steps).into())
    }

    async fn call_model(
        &self,
        step: usize,
        messages: &[Message],
        specs: &[ToolSpec],
        tx: &mpsc::Sender<Result<AgentEvent, AgentError>>,
    ) -> Result<Message, RunError> {
        let mut stream = self
            .model
            .stream(messages, specs)
            .await
            .map_err(AgentError::Model)?;

        let mut content = String::new();
        let mut calls = ToolCallAccumulator::default();

        while let Some(delta) = stream.next().await {
            match delta.map_err(AgentError::Model)? {
                ModelDelta::Text(text) => {
                    content.push_str(&text);
                    self.emit(tx, AgentEvent::new(Node::Model, step, ContentBlock::Text(text)))
                        .await?;
                }
                ModelDelta::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    calls.push(index, id, name.as_deref(), arguments.as_deref());
                    self.emit(
                        tx,
                        AgentEvent::new(Node::Model, step, ContentBlock::ToolCallChunk { name, arguments }),
                    )
                    .await?;
                }
                ModelDelta::Finish(reason) => {
                    log::debug!("Model call {} finished: {}", step, reason);
                }
            }
        }

        Ok(Message::assistant(content, calls.finish()))
    }

    async fn run_tool(&self, call: &ToolCall) -> String {
        let Some(tool) = self.tools.iter().find(|tool| tool.spec().name == call.name) else {
            log::warn!("Model requested unknown tool '{}'", call.name);
            return format!("Error: unknown tool '{}'", call.name);
        };

        let arguments = if call.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(arguments) => arguments,
                Err(e) => {
                    log::warn!("Bad arguments for '{}': {}", call.name, e);
                    return format!("Error: invalid arguments for '{}': {}", call.name, e);
                }
            }
        };

        log::debug!("Calling tool '{}' with {}", call.name, arguments);
        match tool.invoke(arguments).await {
            Ok(output) => output,
            Err(e) => {
                log::warn!("Tool '{}' failed: {:#}", call.name, e);
                format!("Error: {:#}", e)
            }
        }
    }

    async fn emit(
        &self,
        tx: &mpsc::Sender<Result<AgentEvent, AgentError>>,
        event: AgentEvent,
    ) -> Result<(), RunError> {
        tx.send(Ok(event)).await.map_err(|_| RunError::Disconnected)
    }

    async fn commit(&self, config: &RunConfig, messages: &[Message]) -> Result<(), RunError> {
        if let Some(thread_id) = &config.thread_id {
            self.checkpointer
                .append(thread_id, messages)
                .await
                .map_err(AgentError::Checkpoint)?;
        }
        Ok(())
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .thread_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Locks nobody holds or waits on can go.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(thread_id.to_string()).or_default())
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles streamed tool-call fragments by index.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialToolCall>,
}

impl ToolCallAccumulator {
    fn push(&mut self, index: usize, id: Option<String>, name: Option<&str>, arguments: Option<&str>) {
        let call = self.calls.entry(index).or_default();
        if call.id.is_none() {
            call.id = id.filter(|id| !id.is_empty());
        }
        if let Some(name) = name {
            call.name.push_str(name);
        }
        if let Some(arguments) = arguments {
            call.arguments.push_str(arguments);
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall {
                id: call
                    .id
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                name: call.name,
                arguments: call.arguments,
            })
            .collect()
    }
}

/// Build the single agent this process serves: DeepSeek model, retrieval
/// tool, fixed prompt, and a sqlite checkpointer when `DB_URI` is set.
pub async fn get_or_create_agent(
    config: &Config,
    accessor: Arc<VectorStoreAccessor>,
) -> Result<Arc<Agent>> {
    log::info!("Initializing agent checkpointer and model...");

    let checkpointer: Arc<dyn CheckpointStore> = match &config.db_uri {
        Some(uri) => Arc::new(SqliteCheckpointer::connect(uri).await?),
        None => Arc::new(InMemoryCheckpointer::new()),
    };
    log::info!(
        "Checkpointer ready ({})",
        if config.db_uri.is_some() { "sqlite" } else { "in-memory" }
    );

    let model = DeepSeekChatModel::new(
        &config.deepseek_api_key,
        &config.deepseek_base_url,
        &config.chat_model,
    )?;
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(RetrievalTool::new(accessor))];

    let agent = Agent::new(Arc::new(model), tools, AGENT_PROMPT, checkpointer);

    log::info!("Agent created with model '{}'", config.chat_model);
    Ok(Arc::new(agent))
}
