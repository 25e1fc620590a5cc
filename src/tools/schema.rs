//! JSON-schema generation and naming helpers
//!
//! Tools declare their arguments as a JSON Schema object. Struct-style
//! tools bring their own schema (usually written next to the parameter
//! struct); positional tools get one synthesized here with `param1..N`
//! keys. Tool names default to `snake_case` of the method name they wrap.

use serde_json::{json, Value};

/// Primitive parameter kinds a positional tool can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
        }
    }
}

/// Synthesize an object schema for a fixed list of positional primitive
/// parameters: keys are `param1..paramN`, all required.
pub fn positional_schema(params: &[ParamKind]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::with_capacity(params.len());
    for (i, kind) in params.iter().enumerate() {
        let key = format!("param{}", i + 1);
        properties.insert(key.clone(), json!({ "type": kind.type_name() }));
        required.push(Value::String(key));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Convert a `CamelCase` or `mixedCase` method name to `snake_case`.
///
/// Runs of capitals collapse sensibly: `HTTPFetch` → `http_fetch`,
/// `GetWeather` → `get_weather`.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && chars[i - 1].is_lowercase();
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            for lower in c.to_lowercase() {
                out.push(lower);
            }
        } else if c == ' ' || c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

/// The `required` entries of a schema, if any.
pub fn required_fields(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// The `properties` keys of a schema, if any.
pub fn property_names(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

/// The declared type of a named property, e.g. `"integer"`.
pub fn property_type<'a>(schema: &'a Value, name: &str) -> Option<&'a str> {
    schema
        .get("properties")
        .and_then(|p| p.get(name))
        .and_then(|p| p.get("type"))
        .and_then(|t| t.as_str())
}
