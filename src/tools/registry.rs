//! Tool registry
//!
//! Holds the tools an agent registered at session start. Names are unique,
//! lookup is O(1), and iteration follows insertion order so the tool list
//! sent to the LLM is stable across turns.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::tools::schema::{property_names, required_fields, snake_case};
use crate::tools::ToolCtx;

/// Async invoker closure: receives the call context and the coerced JSON
/// argument object, returns the JSON result.
pub type ToolInvoker =
    Arc<dyn Fn(ToolCtx, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One registered tool: metadata, argument schema, and the invoker.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema (`type: object`) describing the arguments.
    pub schema: Value,
    invoker: ToolInvoker,
}

impl ToolSpec {
    /// Build a tool from an explicit name. Most callers go through
    /// [`ToolSpec::from_method`] to keep the `snake_case` default naming.
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, schema: Value, f: F) -> Self
    where
        F: Fn(ToolCtx, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            invoker: Arc::new(f),
        }
    }

    /// Build a tool named after a method: `GetWeather` registers as
    /// `get_weather`.
    pub fn from_method<F>(method: &str, description: impl Into<String>, schema: Value, f: F) -> Self
    where
        F: Fn(ToolCtx, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        Self::new(snake_case(method), description, schema, f)
    }

    pub(crate) fn invoke(&self, ctx: ToolCtx, args: Value) -> BoxFuture<'static, Result<Value>> {
        (self.invoker)(ctx, args)
    }

    /// Validate the schema invariant: every required field must be a
    /// declared property.
    pub fn validate_schema(&self) -> Result<()> {
        let props = property_names(&self.schema);
        for req in required_fields(&self.schema) {
            if !props.contains(&req) {
                return Err(AgentError::InvalidConfiguration(format!(
                    "tool {}: required field {} is not in properties",
                    self.name, req
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Insertion-ordered tool store with unique names.
#[derive(Default)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails with `DuplicateName` if the name is taken,
    /// and rejects schemas that violate the required-subset invariant.
    pub fn register(&mut self, tool: ToolSpec) -> Result<()> {
        tool.validate_schema()?;
        if self.tools.contains_key(&tool.name) {
            return Err(AgentError::DuplicateName(tool.name));
        }
        info!("registered tool: {}", tool.name);
        self.order.push(tool.name.clone());
        self.tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Tools in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_tool(name: &str) -> ToolSpec {
        ToolSpec::new(name, "a test tool", json!({"type": "object", "properties": {}}), |_ctx, _args| {
            Box::pin(async { Ok(json!("ok")) })
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(noop_tool("get_weather")).unwrap();
        assert!(registry.lookup("get_weather").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(noop_tool("dup")).unwrap();
        let err = registry.register(noop_tool("dup")).unwrap_err();
        assert_eq!(err.kind(), "DuplicateName");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_iteration_is_insertion_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(noop_tool(name)).unwrap();
        }
        let names: Vec<&str> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_from_method_snake_cases() {
        let tool = ToolSpec::from_method(
            "GetWeather",
            "desc",
            json!({"type": "object", "properties": {}}),
            |_ctx, _args| Box::pin(async { Ok(json!(null)) }),
        );
        assert_eq!(tool.name, "get_weather");
    }

    #[test]
    fn test_bad_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let tool = ToolSpec::new(
            "broken",
            "required not in properties",
            json!({
                "type": "object",
                "properties": { "a": {"type": "string"} },
                "required": ["a", "ghost"]
            }),
            |_ctx, _args| Box::pin(async { Ok(json!(null)) }),
        );
        assert!(registry.register(tool).is_err());
    }

    #[tokio::test]
    async fn test_invoke_runs_closure() {
        let tool = ToolSpec::new(
            "echo",
            "echoes args",
            json!({"type": "object", "properties": {"msg": {"type": "string"}}}),
            |_ctx, args| Box::pin(async move { Ok(args["msg"].clone()) }),
        );
        let out = tool
            .invoke(ToolCtx::new("s1"), json!({"msg": "hello"}))
            .await
            .unwrap();
        assert_eq!(out, json!("hello"));
    }
}
