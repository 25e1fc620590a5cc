//! Tool dispatch layer
//!
//! Agents expose callable functions to the LLM through an explicit
//! registry: each tool carries a name, a description, a JSON schema for
//! its arguments, and an async invoker closure. The dispatcher resolves
//! LLM tool calls against the registry, coerces arguments, and runs the
//! invoker under the per-call deadline.

pub mod dispatch;
pub mod registry;
pub mod schema;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use registry::{ToolInvoker, ToolRegistry, ToolSpec};
pub use schema::{positional_schema, snake_case, ParamKind};

/// Default per-call tool deadline.
pub const DEFAULT_TOOL_DEADLINE: Duration = Duration::from_secs(30);

/// Execution context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolCtx {
    /// Session the call belongs to.
    pub session_id: String,
    /// Cooperative cancellation; tripped when the session shuts down.
    pub cancel: CancellationToken,
    /// Deadline applied to this invocation.
    pub deadline: Duration,
}

impl ToolCtx {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
            deadline: DEFAULT_TOOL_DEADLINE,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}
