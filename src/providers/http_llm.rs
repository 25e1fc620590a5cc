//! OpenAI-compatible chat-completions client
//!
//! Works against any `/chat/completions` endpoint (OpenAI, OpenRouter,
//! local gateways). Responses are parsed from raw `serde_json::Value`
//! rather than strict structs: providers disagree on optional fields and
//! a strict deserialize breaks on the long tail of them. Streaming parses
//! the SSE byte stream by hand and forwards deltas until the `[DONE]`
//! sentinel.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::chat::message::{ChatMessage, Role, ToolCall};
use crate::error::{AgentError, Result};
use crate::providers::traits::{
    ChatDelta, ChatOptions, ChatStream, ChatStreamItem, LlmProvider, ToolCallDelta,
};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// HTTP chat-completions provider.
#[derive(Clone)]
pub struct HttpLlm {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlm {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(DEFAULT_OPENAI_BASE, api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], opts: &ChatOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if stream {
            body["stream"] = json!(true);
        }
        if !opts.tools.is_empty() {
            body["tools"] = json!(opts.tools);
            body["tool_choice"] = json!(opts.tool_choice.clone().unwrap_or_else(|| "auto".into()));
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if !opts.stop.is_empty() {
            body["stop"] = json!(opts.stop);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::TransientProviderError {
                service: "llm".into(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::TransientProviderError {
                service: "llm".into(),
                reason: format!("HTTP {}: {}", status, truncate(&body, 300)),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    async fn chat(&self, messages: Vec<ChatMessage>, opts: ChatOptions) -> Result<ChatMessage> {
        let body = self.request_body(&messages, &opts, false);
        debug!("llm request: {} messages, {} tools", messages.len(), opts.tools.len());

        let response = self.post(&body).await?;
        let raw: Value = response
            .json()
            .await
            .map_err(|e| AgentError::TransientProviderError {
                service: "llm".into(),
                reason: format!("response did not parse: {}", e),
            })?;

        let message = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| AgentError::TransientProviderError {
                service: "llm".into(),
                reason: "no message in completion response".into(),
            })?;

        Ok(parse_wire_message(message))
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
    ) -> Result<ChatStream> {
        let body = self.request_body(&messages, &opts, true);
        let response = self.post(&body).await?;

        let (tx, stream) = ChatStream::channel();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(ChatStreamItem::Error(AgentError::TransientProviderError {
                                service: "llm".into(),
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by blank lines.
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            let _ = tx.send(ChatStreamItem::End).await;
                            return;
                        }
                        match serde_json::from_str::<Value>(data) {
                            Ok(value) => {
                                if let Some(delta) = parse_stream_delta(&value) {
                                    if tx.send(ChatStreamItem::Delta(delta)).await.is_err() {
                                        return; // consumer gone
                                    }
                                }
                            }
                            Err(e) => warn!("unparsable SSE chunk skipped: {}", e),
                        }
                    }
                }
            }
            // Transport closed without [DONE]; treat as end of stream so
            // accumulated deltas still resolve.
            let _ = tx.send(ChatStreamItem::End).await;
        });

        Ok(stream)
    }
}

/// Serialize a [`ChatMessage`] into the wire object.
fn wire_message(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut out = json!({ "role": role, "content": msg.content });
    if let Some(name) = &msg.name {
        out["name"] = json!(name);
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if msg.has_tool_calls() {
        out["tool_calls"] = json!(msg
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments }
                })
            })
            .collect::<Vec<_>>());
    }
    out
}

/// Parse a completion `message` object leniently.
fn parse_wire_message(message: &Value) -> ChatMessage {
    let content = match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        // Some providers return content as an array of typed parts.
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                (part.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| part.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    };

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    Some(ToolCall {
                        id: tc
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: func
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        // Arguments arrive as a JSON string or a raw object
                        // depending on the model; normalize to a string.
                        arguments: match func.get("arguments") {
                            Some(Value::String(s)) => s.clone(),
                            Some(Value::Null) | None => String::new(),
                            Some(other) => other.to_string(),
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if tool_calls.is_empty() {
        ChatMessage::assistant(content)
    } else {
        ChatMessage::assistant_with_tools(content, tool_calls)
    }
}

/// Parse one streamed chunk into a delta, if it carries one.
fn parse_stream_delta(value: &Value) -> Option<ChatDelta> {
    let delta = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("delta"))?;

    let role = delta.get("role").and_then(|r| r.as_str()).and_then(|r| match r {
        "assistant" => Some(Role::Assistant),
        "user" => Some(Role::User),
        "system" => Some(Role::System),
        "tool" => Some(Role::Tool),
        _ => None,
    });

    let content = delta
        .get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string());

    let tool_calls = delta
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .map(|tc| ToolCallDelta {
                    index: tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize,
                    id: tc.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
                    name: tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    arguments: tc
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ChatDelta {
        role,
        content,
        tool_calls,
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_tool_result() {
        let result = crate::chat::message::ToolResult {
            tool_call_id: "c1".into(),
            name: "get_weather".into(),
            payload: json!("sunny"),
        };
        let msg = ChatMessage::tool_result(&result);
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert_eq!(wire["name"], "get_weather");
    }

    #[test]
    fn test_wire_message_assistant_with_tools() {
        let msg = ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "t".into(),
                arguments: r#"{"a":1}"#.into(),
            }],
        );
        let wire = wire_message(&msg);
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "t");
    }

    #[test]
    fn test_parse_wire_message_string_content() {
        let message = json!({ "role": "assistant", "content": "hello" });
        let parsed = parse_wire_message(&message);
        assert_eq!(parsed.content, "hello");
        assert!(!parsed.has_tool_calls());
    }

    #[test]
    fn test_parse_wire_message_part_array_content() {
        let message = json!({
            "role": "assistant",
            "content": [
                { "type": "text", "text": "Hello " },
                { "type": "text", "text": "world" }
            ]
        });
        assert_eq!(parse_wire_message(&message).content, "Hello world");
    }

    #[test]
    fn test_parse_wire_message_object_arguments() {
        // Some models emit arguments as a raw object instead of a string.
        let message = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "c9",
                "type": "function",
                "function": { "name": "read", "arguments": { "path": "/tmp/x" } }
            }]
        });
        let parsed = parse_wire_message(&message);
        assert_eq!(parsed.tool_calls.len(), 1);
        let args: Value = serde_json::from_str(&parsed.tool_calls[0].arguments).unwrap();
        assert_eq!(args["path"], "/tmp/x");
    }

    #[test]
    fn test_parse_stream_delta_content() {
        let chunk = json!({
            "choices": [{ "delta": { "role": "assistant", "content": "Hi" } }]
        });
        let delta = parse_stream_delta(&chunk).unwrap();
        assert_eq!(delta.role, Some(Role::Assistant));
        assert_eq!(delta.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_parse_stream_delta_tool_fragment() {
        let chunk = json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0,
                "id": "c1",
                "function": { "name": "get_weather", "arguments": "{\"lo" }
            }] } }]
        });
        let delta = parse_stream_delta(&chunk).unwrap();
        assert_eq!(delta.tool_calls.len(), 1);
        assert_eq!(delta.tool_calls[0].name.as_deref(), Some("get_weather"));
        assert_eq!(delta.tool_calls[0].arguments, "{\"lo");
    }

    #[test]
    fn test_request_body_includes_tools_and_options() {
        let llm = HttpLlm::new("key", "test-model");
        let opts = ChatOptions {
            tools: vec![json!({"type": "function", "function": {"name": "t"}})],
            tool_choice: None,
            temperature: Some(0.2),
            max_tokens: Some(256),
            stop: vec!["END".into()],
        };
        let body = llm.request_body(&[ChatMessage::user("hi")], &opts, true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop"][0], "END");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.starts_with('h'));
    }
}
