//! Typed error taxonomy for the runtime
//!
//! Every fallible library operation returns `Result<T, AgentError>`. The
//! CLI surface wraps these in `anyhow` for human-facing context. Panics in
//! supervised tasks are caught and converted into `AgentError::Panic`
//! before they can cross a task boundary.

use std::time::Duration;

/// Errors produced by the voice-agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Operation requires a started component.
    #[error("not started: {0}")]
    NotStarted(String),

    /// Component was already started.
    #[error("already started: {0}")]
    AlreadyStarted(String),

    /// Required configuration is missing or contradictory.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A required provider factory returned nothing or failed to build.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Named plugin is not registered.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Named tool is not registered.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A tool with this name is already registered.
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),

    /// Tool arguments failed to parse or coerce, or a required field is missing.
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool ran and returned an error.
    #[error("tool {tool} failed: {reason}")]
    ToolExecutionError { tool: String, reason: String },

    /// STT/LLM/TTS I/O failure; retriable.
    #[error("provider error ({service}): {reason}")]
    TransientProviderError { service: String, reason: String },

    /// A per-call deadline elapsed.
    #[error("{operation} timed out after {deadline:?}")]
    Timeout {
        operation: String,
        deadline: Duration,
    },

    /// Cooperative cancellation. Never retried, never user-visible.
    #[error("cancelled")]
    Cancelled,

    /// The LLM produced a tool call whose arguments are not valid JSON.
    #[error("malformed tool call {name}: {reason}")]
    MalformedToolCall { name: String, reason: String },

    /// AEC, resampling, or format mismatch on the audio path.
    #[error("audio processing error: {0}")]
    AudioProcessingError(String),

    /// Job queue is saturated.
    #[error("job queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// A supervised task panicked. Converted from `JoinError`, handled like
    /// any other task failure.
    #[error("task panicked: {0}")]
    Panic(String),
}

impl AgentError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientProviderError { .. } | AgentError::Timeout { .. }
        )
    }

    /// Whether this error came from cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }

    /// Short machine-readable kind, used in tool-result error payloads and
    /// structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::NotStarted(_) => "NotStarted",
            AgentError::AlreadyStarted(_) => "AlreadyStarted",
            AgentError::InvalidConfiguration(_) => "InvalidConfiguration",
            AgentError::ServiceUnavailable(_) => "ServiceUnavailable",
            AgentError::PluginNotFound(_) => "PluginNotFound",
            AgentError::ToolNotFound(_) => "ToolNotFound",
            AgentError::DuplicateName(_) => "DuplicateName",
            AgentError::InvalidArguments { .. } => "InvalidArguments",
            AgentError::ToolExecutionError { .. } => "ToolExecutionError",
            AgentError::TransientProviderError { .. } => "TransientProviderError",
            AgentError::Timeout { .. } => "Timeout",
            AgentError::Cancelled => "Cancelled",
            AgentError::MalformedToolCall { .. } => "MalformedToolCall",
            AgentError::AudioProcessingError(_) => "AudioProcessingError",
            AgentError::QueueFull { .. } => "QueueFull",
            AgentError::Panic(_) => "Panic",
        }
    }

    /// Convert a tokio join error into a typed error.
    pub fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AgentError::Panic(msg)
        } else {
            AgentError::Cancelled
        }
    }
}

/// Convenience alias used throughout the library core.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let transient = AgentError::TransientProviderError {
            service: "stt".into(),
            reason: "connection reset".into(),
        };
        assert!(transient.is_retriable());

        let timeout = AgentError::Timeout {
            operation: "llm".into(),
            deadline: Duration::from_secs(15),
        };
        assert!(timeout.is_retriable());

        assert!(!AgentError::Cancelled.is_retriable());
        assert!(!AgentError::ToolNotFound("x".into()).is_retriable());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(AgentError::Cancelled.kind(), "Cancelled");
        assert_eq!(
            AgentError::QueueFull { capacity: 100 }.kind(),
            "QueueFull"
        );
        assert_eq!(
            AgentError::ToolNotFound("get_weather".into()).kind(),
            "ToolNotFound"
        );
    }

    #[tokio::test]
    async fn test_from_join_panic() {
        let handle = tokio::spawn(async { panic!("boom") });
        let err = handle.await.unwrap_err();
        let converted = AgentError::from_join(err);
        match converted {
            AgentError::Panic(msg) => assert!(msg.contains("boom")),
            other => panic!("expected Panic, got {:?}", other),
        }
    }

    #[test]
    fn test_display_messages_are_plain_language() {
        let err = AgentError::InvalidArguments {
            tool: "get_weather".into(),
            reason: "missing field `location`".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("get_weather"));
        assert!(rendered.contains("location"));
    }
}
