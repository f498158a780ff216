use rag_agent::{Message, RunConfig};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Configurable {
    pub thread_id: Option<String>,
}

/// Body of `POST /chat/messages`.
///
/// Clients send only the new turn; earlier turns come from the thread's
/// checkpoint.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub configurable: Option<Configurable>,
}

impl ChatRequest {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            thread_id: self
                .configurable
                .as_ref()
                .and_then(|c| c.thread_id.clone())
                .filter(|id| !id.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_agent::Role;

    #[test]
    fn parses_frontend_payload() {
        let body = r#"{
            "messages": [{"role": "user", "content": "hello"}],
            "configurable": {"thread_id": "t-1"}
        }"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();

        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[0].content, "hello");
        assert_eq!(req.run_config().thread_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn thread_id_is_optional() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"messages": [{"role": "user", "content": "hi"}]}"#).unwrap();
        assert_eq!(req.run_config(), RunConfig::default());

        let req: ChatRequest = serde_json::from_str(
            r#"{"messages": [], "configurable": {"thread_id": " "}}"#,
        )
        .unwrap();
        assert!(req.run_config().thread_id.is_none());
    }
}
