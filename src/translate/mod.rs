//! API translation between Anthropic and `OpenAI` formats.
//!
//! The core of the proxy: converts requests, responses, and streaming events
//! between the two API formats. All translation functions are pure (no I/O).

pub mod anthropic_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod schema;
pub mod streaming;
pub mod tool_parsers;

use sha2::{Digest, Sha256};

/// Signature attached to a thinking block: SHA-256 over its full text.
pub fn thinking_signature(thinking: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(thinking.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map an `OpenAI` `finish_reason` to an Anthropic `stop_reason`.
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls" | "function_call") => "tool_use",
        // "stop", "content_filter", unknown and absent
        _ => "end_turn",
    }
}

/// Final stop reason once it is known whether any tool call was produced.
pub fn final_stop_reason(reason: Option<&str>, produced_tool_call: bool) -> &'static str {
    match map_finish_reason(reason) {
        "max_tokens" => "max_tokens",
        _ if produced_tool_call => "tool_use",
        mapped => mapped,
    }
}
