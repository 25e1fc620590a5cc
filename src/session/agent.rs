//! Agent contract
//!
//! An agent is the application-defined half of a session: it carries the
//! instructions, registers the tools the LLM may call, and observes the
//! session lifecycle. All callbacks have defaults so a minimal agent is a
//! name and a prompt.

use async_trait::async_trait;

use crate::audio::frame::AudioFrame;
use crate::chat::message::ChatMessage;
use crate::error::Result;
use crate::tools::ToolRegistry;

/// Identity handed to lifecycle callbacks; deliberately narrow so agents
/// cannot reach back into session internals.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_name: String,
}

/// Application-defined conversational agent.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str {
        "agent"
    }

    /// System prompt pinned into the chat context, if any.
    fn instructions(&self) -> Option<String> {
        None
    }

    /// Register callable tools. Called once at session start; the
    /// registry is read-only afterwards.
    fn register_tools(&self, _registry: &mut ToolRegistry) -> Result<()> {
        Ok(())
    }

    /// Session is up and listening.
    async fn on_enter(&self, _session: &SessionInfo) {}

    /// Session is tearing down.
    async fn on_exit(&self, _session: &SessionInfo) {}

    /// A user turn was transcribed and appended to the context. Runs
    /// before the LLM sees the turn.
    async fn on_user_turn_completed(&self, _message: &ChatMessage) {}

    /// Raw (post-AEC) audio frame. Must not block; heavy work belongs on
    /// the agent's own tasks.
    fn on_audio_frame(&self, _frame: &AudioFrame) {}

    /// The segmenter opened a speech segment.
    fn on_speech_detected(&self) {}

    /// The segmenter closed a speech segment.
    fn on_speech_ended(&self) {}
}

/// The no-op agent: a prompt and nothing else. Useful for console mode
/// and tests.
pub struct BaseAgent {
    name: String,
    instructions: Option<String>,
}

impl BaseAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[async_trait]
impl Agent for BaseAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn instructions(&self) -> Option<String> {
        self.instructions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_agent_defaults() {
        let agent = BaseAgent::new("kelly");
        assert_eq!(agent.name(), "kelly");
        assert!(agent.instructions().is_none());

        let mut registry = ToolRegistry::new();
        agent.register_tools(&mut registry).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_base_agent_instructions() {
        let agent = BaseAgent::new("kelly").with_instructions("You are Kelly.");
        assert_eq!(agent.instructions().as_deref(), Some("You are Kelly."));
    }
}
