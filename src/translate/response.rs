use serde_json::{json, Value};

use super::anthropic_types::{
    ErrorResponse, MessagesRequest, MessagesResponse, ResponseContentBlock, Usage,
};
use super::openai_types::{ChatCompletionResponse, ChatErrorResponse, ChatToolCall};
use super::schema::coerce_arguments;
use super::tool_parsers::{Extraction, ToolCallScanner};
use super::{final_stop_reason, thinking_signature};

/// Translate an OpenAI Chat Completion response into an Anthropic Messages response.
/// Pure function: `req` is what Claude Code originally sent; its model name is
/// reported back and its tool schemas drive argument coercion.
pub fn openai_to_anthropic(resp: &ChatCompletionResponse, req: &MessagesRequest) -> MessagesResponse {
    let tools = req.tools();
    let choice = resp.choices.first();

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(c) = choice {
        if let Some(reasoning) = c.message.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            content.push(ResponseContentBlock::Thinking {
                thinking: reasoning.to_string(),
                signature: Some(thinking_signature(reasoning)),
            });
        }

        if let Some(text) = c.message.content.as_deref() {
            content.extend(split_embedded_tool_calls(text, req));
        }

        if let Some(ref tool_calls) = c.message.tool_calls {
            for tc in tool_calls {
                let input = decode_native_arguments(tc);
                content.push(ResponseContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input: coerce_arguments(&tc.function.name, input, tools),
                });
            }
        }
    }

    let produced_tool_call = content
        .iter()
        .any(|b| matches!(b, ResponseContentBlock::ToolUse { .. }));

    // Ensure at least one content block (Claude Code expects non-empty content)
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = final_stop_reason(
        choice.and_then(|c| c.finish_reason.as_deref()),
        produced_tool_call,
    );

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens.unwrap_or(0),
        output_tokens: u.completion_tokens.unwrap_or(0),
        cache_creation_input_tokens: u.cache_creation_input_tokens,
        cache_read_input_tokens: u.cached_tokens(),
    });

    // Use the OpenAI response ID, prefixed to look like an Anthropic ID
    let id = format!("msg_{}", resp.id.trim_start_matches("chatcmpl-"));

    MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: req.model.clone(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Split assistant text into text blocks and the tool calls embedded in it.
fn split_embedded_tool_calls(text: &str, req: &MessagesRequest) -> Vec<ResponseContentBlock> {
    let tools = req.tools();
    let scanner = ToolCallScanner::default();
    let mut blocks = Vec::new();
    let mut rest = text;

    let push_text = |blocks: &mut Vec<ResponseContentBlock>, segment: &str| {
        let segment = segment.trim();
        if !segment.is_empty() {
            blocks.push(ResponseContentBlock::Text {
                text: segment.to_string(),
            });
        }
    };

    loop {
        match scanner.scan(rest, tools) {
            Extraction::ToolCallFound {
                leading,
                calls,
                consumed,
            } => {
                push_text(&mut blocks, &rest[..leading]);
                for call in calls {
                    let input = coerce_arguments(&call.name, call.arguments, tools);
                    blocks.push(ResponseContentBlock::ToolUse {
                        id: call.id,
                        name: call.name,
                        input,
                    });
                }
                rest = &rest[consumed..];
            }
            Extraction::Literal { consumed } => {
                push_text(&mut blocks, &rest[..consumed]);
                rest = &rest[consumed..];
            }
            // Nothing more to extract; an unterminated marker stays literal text.
            Extraction::PlainText { .. } | Extraction::Incomplete { .. } => {
                push_text(&mut blocks, rest);
                break;
            }
        }
    }

    blocks
}

/// Parse native tool-call arguments: plain JSON, else a JSON string holding
/// JSON, else an error object carrying the raw text.
fn decode_native_arguments(tc: &ChatToolCall) -> Value {
    let raw = tc.function.arguments.trim();
    if raw.is_empty() {
        return json!({});
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Value::String(inner) = &value {
            if let Ok(decoded) = serde_json::from_str::<Value>(inner) {
                return decoded;
            }
        }
        return value;
    }
    tracing::error!(tool = %tc.function.name, id = %tc.id, "Failed to decode tool arguments");
    json!({"error": "Failed to decode arguments", "raw": raw})
}

/// Translate an OpenAI error into an Anthropic error response
pub fn openai_error_to_anthropic(err: &ChatErrorResponse) -> ErrorResponse {
    let error_type = match err.error.error_type.as_str() {
        "invalid_request_error" => "invalid_request_error",
        "authentication_error" | "invalid_api_key" => "authentication_error",
        "permission_error" => "permission_error",
        "not_found_error" => "not_found_error",
        "rate_limit_error" | "rate_limit_exceeded" => "rate_limit_error",
        _ => "api_error",
    };

    ErrorResponse::new(error_type, &err.error.message)
}

/// Anthropic error type for an upstream HTTP status.
pub fn error_type_for_status(status: u16) -> &'static str {
    match status {
        400 | 422 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    }
}
