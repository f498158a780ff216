use crate::models::*;
use crate::tools::ToolSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// One increment of a streamed model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Text(String),
    /// Fragment of a tool call; fragments sharing `index` belong together.
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    Finish(String),
}

pub type DeltaStream = BoxStream<'static, Result<ModelDelta>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn stream(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<DeltaStream>;
}

/// DeepSeek's OpenAI-compatible chat completions API.
pub struct DeepSeekChatModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl DeepSeekChatModel {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        // Assistant turns that only call tools carry no content.
        let content = if message.role == Role::Assistant
            && message.content.is_empty()
            && !message.tool_calls.is_empty()
        {
            None
        } else {
            Some(message.content.as_str())
        };

        Self {
            role: message.role,
            content,
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: &call.id,
                    kind: "function",
                    function: WireFunction {
                        name: &call.name,
                        arguments: &call.arguments,
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, PartialEq)]
enum StreamLine {
    Deltas(Vec<ModelDelta>),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim_start(),
        None => return Ok(StreamLine::Skip),
    };

    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).with_context(|| format!("unparseable stream chunk: {}", data))?;
    if let Some(error) = chunk.error {
        anyhow::bail!("DeepSeek stream error: {}", error);
    }

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(delta) = choice.delta {
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                deltas.push(ModelDelta::Text(text));
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                deltas.push(ModelDelta::ToolCall {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(ModelDelta::Finish(reason));
        }
    }

    Ok(StreamLine::Deltas(deltas))
}

/// Splits a byte stream into lines, holding partial lines (and partial
/// UTF-8 sequences) until their newline arrives.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string(),
            );
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        Some(rest).filter(|r| !r.is_empty())
    }
}

#[async_trait]
impl ChatModel for DeepSeekChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<DeltaStream> {
        let request = CompletionRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools
                .iter()
                .map(|spec| WireTool {
                    kind: "function",
                    function: spec,
                })
                .collect(),
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("DeepSeek request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("DeepSeek API error {}: {}", status, error_text));
        }

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = LineBuffer::default();

            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow::Error::new(e).context("DeepSeek stream interrupted")))
                            .await;
                        return;
                    }
                };

                for line in buffer.push(&chunk) {
                    match parse_stream_line(&line) {
                        Ok(StreamLine::Deltas(deltas)) => {
                            for delta in deltas {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(StreamLine::Done) => return,
                        Ok(StreamLine::Skip) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            if let Some(line) = buffer.finish() {
                match parse_stream_line(&line) {
                    Ok(StreamLine::Deltas(deltas)) => {
                        for delta in deltas {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let line = r#"data: {"id":"1","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(
            parse_stream_line(line).unwrap(),
            StreamLine::Deltas(vec![ModelDelta::Text("Hel".into())])
        );
    }

    #[test]
    fn parses_tool_call_fragments_and_finish() {
        let first = r#"data: {"choices":[{"index":0,"delta":{"content":null,"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"retrieve_docs","arguments":""}}]},"finish_reason":null}]}"#;
        let second = r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":\"x\"}"}}]},"finish_reason":"tool_calls"}]}"#;

        assert_eq!(
            parse_stream_line(first).unwrap(),
            StreamLine::Deltas(vec![ModelDelta::ToolCall {
                index: 0,
                id: Some("call_1".into()),
                name: Some("retrieve_docs".into()),
                arguments: Some(String::new()),
            }])
        );
        assert_eq!(
            parse_stream_line(second).unwrap(),
            StreamLine::Deltas(vec![
                ModelDelta::ToolCall {
                    index: 0,
                    id: None,
                    name: None,
                    arguments: Some(r#"{"query":"x"}"#.into()),
                },
                ModelDelta::Finish("tool_calls".into()),
            ])
        );
    }

    #[test]
    fn recognises_done_and_ignores_other_lines() {
        assert_eq!(parse_stream_line("data: [DONE]").unwrap(), StreamLine::Done);
        assert_eq!(parse_stream_line("").unwrap(), StreamLine::Skip);
        assert_eq!(parse_stream_line(": keep-alive").unwrap(), StreamLine::Skip);
        assert_eq!(parse_stream_line("event: message").unwrap(), StreamLine::Skip);
    }

    #[test]
    fn empty_content_and_null_tool_calls_yield_nothing() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"","tool_calls":null},"finish_reason":null}]}"#;
        assert_eq!(parse_stream_line(line).unwrap(), StreamLine::Deltas(vec![]));
    }

    #[test]
    fn error_payload_is_an_error() {
        let line = r#"data: {"error":{"message":"rate limited"}}"#;
        assert!(parse_stream_line(line).is_err());
        assert!(parse_stream_line("data: {not json").is_err());
    }

    #[test]
    fn line_buffer_joins_split_lines_and_utf8() {
        let mut buffer = LineBuffer::default();
        let text = "data: {\"t\":\"héllo\"}\n\ndata: [DONE]\n";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        let split = text.find('é').unwrap() + 1;

        let mut lines = buffer.push(&bytes[..split]);
        assert!(lines.is_empty());
        lines.extend(buffer.push(&bytes[split..]));
        assert_eq!(lines, vec!["data: {\"t\":\"héllo\"}", "", "data: [DONE]"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_returns_unterminated_tail() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: [DONE]").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn tool_only_assistant_message_has_no_content() {
        let message = Message::assistant(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "retrieve_docs".into(),
                arguments: "{}".into(),
            }],
        );
        let wire = serde_json::to_value(WireMessage::from(&message)).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "retrieve_docs", "arguments": "{}"}
                }]
            })
        );

        let tool = serde_json::to_value(WireMessage::from(&Message::tool("call_1", "result"))).unwrap();
        assert_eq!(
            tool,
            serde_json::json!({"role": "tool", "content": "result", "tool_call_id": "call_1"})
        );
    }
}
