//! Schema-driven coercion of tool-call arguments.
//!
//! Models frequently emit `"42"` where the tool declares an integer, or a
//! JSON-encoded string where it declares an array. Before a tool call is
//! handed back to the client its top-level arguments are coerced against the
//! tool's `input_schema`. Coercion never fails the call: a value that cannot
//! be converted is kept as-is and a warning is logged.

use super::anthropic_types::Tool;
use serde_json::{Map, Number, Value};

/// Look up the `input_schema` of `tool_name` among the request's tools.
pub fn find_tool_schema<'a>(tool_name: &str, tools: &'a [Tool]) -> Option<&'a Value> {
    tools
        .iter()
        .find(|t| t.name == tool_name)
        .map(|t| &t.input_schema)
}

/// Coerce every top-level argument that the tool's schema declares.
pub fn coerce_arguments(tool_name: &str, args: Value, tools: &[Tool]) -> Value {
    let Some(schema) = find_tool_schema(tool_name, tools) else {
        if !tools.is_empty() {
            tracing::warn!(tool = tool_name, "Tool not declared in request, arguments left unchanged");
        }
        return args;
    };

    let Value::Object(fields) = args else {
        return args;
    };
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Value::Object(fields);
    };

    let coerced = fields
        .into_iter()
        .map(|(name, value)| match properties.get(&name) {
            Some(param_schema) => {
                let value = coerce_value(value, param_schema, &name, tool_name);
                (name, value)
            }
            None => (name, value),
        })
        .collect::<Map<_, _>>();
    Value::Object(coerced)
}

/// Lenient wrapper: on failure keep the original value and warn.
pub fn coerce_value(value: Value, schema: &Value, path: &str, tool_name: &str) -> Value {
    match convert(&value, schema, path, tool_name) {
        Ok(converted) => converted,
        Err(reason) => {
            tracing::warn!(
                tool = tool_name,
                parameter = path,
                %reason,
                "Failed to coerce parameter, keeping original value"
            );
            value
        }
    }
}

fn convert(value: &Value, schema: &Value, path: &str, tool_name: &str) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if matches!(value, Value::String(s) if s.eq_ignore_ascii_case("null")) {
        return Ok(Value::Null);
    }

    let declared = schema_type(schema);

    match declared {
        Some("array") => {
            let items = match value {
                Value::Array(items) => items.clone(),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(items)) => items,
                    _ => return Err(format!("expected array, got string {s:?}")),
                },
                other => return Err(format!("expected array, got {other}")),
            };
            let item_schema = schema.get("items");
            return Ok(Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| match item_schema {
                        Some(s) => coerce_value(item, s, &format!("{path}[{i}]"), tool_name),
                        None => item,
                    })
                    .collect(),
            ));
        }
        Some("object") => {
            let fields = match value {
                Value::Object(fields) => fields.clone(),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Object(fields)) => fields,
                    _ => return Err(format!("expected object, got string {s:?}")),
                },
                other => return Err(format!("expected object, got {other}")),
            };
            let properties = schema.get("properties").and_then(Value::as_object);
            return Ok(Value::Object(
                fields
                    .into_iter()
                    .map(|(key, v)| match properties.and_then(|p| p.get(&key)) {
                        Some(s) => {
                            let v = coerce_value(v, s, &format!("{path}.{key}"), tool_name);
                            (key, v)
                        }
                        None => (key, v),
                    })
                    .collect(),
            ));
        }
        _ => {}
    }

    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(variants) = schema.get(combinator).and_then(Value::as_array) {
            return variants
                .iter()
                .find_map(|sub| convert(value, sub, path, tool_name).ok())
                .ok_or_else(|| format!("no {combinator} alternative accepts {value}"));
        }
    }

    match declared {
        Some("number") => to_number(value),
        Some("integer") => to_integer(value),
        Some("boolean") => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => Ok(Value::Bool(s.trim().eq_ignore_ascii_case("true"))),
            other => Err(format!("expected boolean, got {other}")),
        },
        Some("string") => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        // Unknown or missing type: nothing to coerce towards.
        _ => Ok(value.clone()),
    }
}

/// `type` may be a string or a list like `["integer", "null"]`.
fn schema_type(schema: &Value) -> Option<&str> {
    match schema.get("type")? {
        Value::String(t) => Some(t.as_str()),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ => None,
    }
}

fn to_number(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::Number(i.into()));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("{s:?} is not a number"))
        }
        other => Err(format!("expected number, got {other}")),
    }
}

fn to_integer(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| Value::Number((f.trunc() as i64).into()))
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(|i| Value::Number(i.into()))
            .map_err(|_| format!("{s:?} is not an integer")),
        other => Err(format!("expected integer, got {other}")),
    }
}
