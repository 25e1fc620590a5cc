//! Per-session chat history
//!
//! Append-only ordered log with an optional pinned system prompt at index
//! 0. Only the orchestrator task writes; everything else reads via
//! [`ChatContext::render`] snapshots.
//!
//! Tool-pairing invariants maintained here:
//! - every `tool` message refers to a `tool_calls` entry on an earlier
//!   assistant message,
//! - an assistant message with tool calls is followed by its tool results
//!   before the next assistant turn.

use tracing::warn;

use crate::chat::message::{ChatMessage, Role, ToolCall, ToolResult};
use crate::error::{AgentError, Result};

/// Ordered, typed message log for one session.
#[derive(Debug, Default)]
pub struct ChatContext {
    messages: Vec<ChatMessage>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with a pinned system prompt.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(prompt)],
        }
    }

    /// Install or replace the pinned system prompt at index 0.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let msg = ChatMessage::system(prompt);
        match self.messages.first() {
            Some(first) if first.role == Role::System => self.messages[0] = msg,
            _ => self.messages.insert(0, msg),
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Record an assistant turn that requested tool calls.
    pub fn add_tool_calls(&mut self, content: impl Into<String>, calls: Vec<ToolCall>) {
        self.messages
            .push(ChatMessage::assistant_with_tools(content, calls));
    }

    /// Record a tool result. Fails unless an earlier assistant message
    /// requested a call with this id.
    pub fn add_tool_result(&mut self, result: &ToolResult) -> Result<()> {
        let known = self.messages.iter().rev().any(|m| {
            m.role == Role::Assistant
                && m.tool_calls.iter().any(|c| c.id == result.tool_call_id)
        });
        if !known {
            warn!(
                "tool result for unknown call id {} dropped",
                result.tool_call_id
            );
            return Err(AgentError::InvalidArguments {
                tool: result.name.clone(),
                reason: format!("no pending tool call with id {}", result.tool_call_id),
            });
        }
        self.messages.push(ChatMessage::tool_result(result));
        Ok(())
    }

    /// Snapshot suitable for sending to an LLM.
    pub fn render(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True when the log holds nothing, or only the system prompt; the
    /// condition the greeting flow checks at session start.
    pub fn is_effectively_empty(&self) -> bool {
        match self.messages.len() {
            0 => true,
            1 => self.messages[0].role == Role::System,
            _ => false,
        }
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Drop everything except the pinned system prompt.
    pub fn clear(&mut self) {
        let system = self
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();
        self.messages.clear();
        if let Some(system) = system {
            self.messages.push(system);
        }
    }

    /// Verify the tool-pairing invariant over the whole log: each
    /// requested call id has exactly one tool result before the next
    /// assistant message. Used by tests and debug assertions.
    pub fn verify_tool_pairing(&self) -> Result<()> {
        let mut pending: Vec<String> = Vec::new();
        for msg in &self.messages {
            match msg.role {
                Role::Assistant => {
                    if !pending.is_empty() {
                        return Err(AgentError::InvalidArguments {
                            tool: "context".into(),
                            reason: format!(
                                "assistant turn before tool results for {:?}",
                                pending
                            ),
                        });
                    }
                    pending = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
                }
                Role::Tool => {
                    let id = msg.tool_call_id.as_deref().unwrap_or("");
                    match pending.iter().position(|p| p == id) {
                        Some(at) => {
                            pending.remove(at);
                        }
                        None => {
                            return Err(AgentError::InvalidArguments {
                                tool: msg.name.clone().unwrap_or_default(),
                                reason: format!("unmatched tool result {}", id),
                            })
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
