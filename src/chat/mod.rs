//! Conversation model: typed chat messages and the per-session context log.

pub mod context;
pub mod message;

pub use context::ChatContext;
pub use message::{ChatMessage, Role, ToolCall, ToolResult};
