use crate::chat_request::ChatRequest;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::post,
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use rag_agent::{Agent, AgentError, AgentEvent, ContentBlock, Node};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

pub const DONE: &str = "[DONE]";

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/chat/messages", post(chat_messages))
        .layer(cors)
        .with_state(state)
}

/// Streams the agent's answer as SSE `data:` frames, always ending with
/// `data: [DONE]`.
pub async fn chat_messages(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorBody>)> {
    if request.messages.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: "messages must not be empty".to_string(),
            }),
        ));
    }

    let config = request.run_config();
    log::debug!(
        "Chat request with {} messages for thread {:?}",
        request.messages.len(),
        config.thread_id
    );

    let events = ReceiverStream::new(state.agent.stream(request.messages, config))
        .filter_map(|item| futures::future::ready(frame(item).map(Ok)))
        .chain(stream::once(async { Ok(Event::default().data(DONE)) }));

    Ok(Sse::new(events))
}

/// Only model text reaches the client; tool calls and tool output stay
/// server-side.
fn frame(item: Result<AgentEvent, AgentError>) -> Option<Event> {
    match item {
        Ok(event) if event.metadata.node == Node::Model => {
            let text: String = event
                .chunk
                .content_blocks
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(t) => Some(t),
                    ContentBlock::ToolCallChunk { .. } => None,
                })
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(Event::default().data(serde_json::json!({ "text": text }).to_string()))
            }
        }
        Ok(_) => None,
        Err(e) => Some(Event::default().data(serde_json::json!({ "error": e.to_string() }).to_string())),
    }
}
