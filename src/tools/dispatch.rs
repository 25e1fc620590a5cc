//! Tool call dispatch
//!
//! Resolves an LLM [`ToolCall`] against the registry, unmarshals the
//! argument JSON with primitive coercion, and runs the invoker under the
//! per-call deadline. Failures come back as typed errors; the orchestrator
//! turns them into error payloads on the tool-result message so the LLM
//! can react instead of the session crashing.

use serde_json::{Map, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::chat::message::{ToolCall, ToolResult};
use crate::error::{AgentError, Result};
use crate::tools::registry::ToolRegistry;
use crate::tools::schema::{property_type, required_fields};
use crate::tools::ToolCtx;

impl ToolRegistry {
    /// Dispatch one tool call: lookup → parse → coerce → invoke → wrap.
    pub async fn dispatch(&self, ctx: ToolCtx, call: &ToolCall) -> Result<ToolResult> {
        let tool = self
            .lookup(&call.name)
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;

        let raw: Value = if call.arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&call.arguments).map_err(|e| AgentError::InvalidArguments {
                tool: call.name.clone(),
                reason: format!("argument JSON did not parse: {}", e),
            })?
        };

        let args = coerce_arguments(&call.name, raw, &tool.schema)?;
        debug!("dispatching tool {} with {}", call.name, args);

        let deadline = ctx.deadline;
        let cancel = ctx.cancel.clone();
        let fut = tool.invoke(ctx, args);

        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = timeout(deadline, fut) => match outcome {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    warn!("tool {} failed: {}", call.name, e);
                    return Err(AgentError::ToolExecutionError {
                        tool: call.name.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(AgentError::Timeout {
                        operation: format!("tool {}", call.name),
                        deadline,
                    })
                }
            },
        };

        Ok(ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            payload,
        })
    }
}

/// Coerce the parsed argument object toward the schema's declared
/// primitive types and check required fields.
///
/// Coercions applied: numeric strings → int/float where the schema says
/// so, JSON numbers → the declared numeric width, booleans preserved
/// (including `"true"`/`"false"` strings), numbers stringified where a
/// string is declared. Anything that still mismatches is handed to the
/// tool as-is; the invoker's own deserialization has the final say.
fn coerce_arguments(tool: &str, raw: Value, schema: &Value) -> Result<Value> {
    let mut obj = match raw {
        Value::Object(map) => map,
        other => {
            return Err(AgentError::InvalidArguments {
                tool: tool.to_string(),
                reason: format!("expected a JSON object, got {}", other),
            })
        }
    };

    for req in required_fields(schema) {
        if !obj.contains_key(&req) {
            return Err(AgentError::InvalidArguments {
                tool: tool.to_string(),
                reason: format!("missing required field `{}`", req),
            });
        }
    }

    let keys: Vec<String> = obj.keys().cloned().collect();
    for key in keys {
        let Some(kind) = property_type(schema, &key) else {
            continue;
        };
        let value = obj.get(&key).cloned().unwrap_or(Value::Null);
        if let Some(coerced) = coerce_value(value, kind) {
            obj.insert(key, coerced);
        }
    }

    Ok(Value::Object(obj))
}

fn coerce_value(value: Value, kind: &str) -> Option<Value> {
    match (kind, &value) {
        ("integer", Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        ("integer", Value::Number(n)) => n.as_f64().map(|f| Value::from(f as i64)),
        ("number", Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
        ("boolean", Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
        _ => None,
    }
}
