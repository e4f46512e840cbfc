//! Kimi-K2 tool-call markup.
//!
//! ```text
//! <|tool_calls_section_begin|>
//! <|tool_call_begin|>functions.get_weather:0<|tool_call_argument_begin|>{"city": "Paris"}<|tool_call_end|>
//! <|tool_calls_section_end|>
//! ```
//!
//! The header is `[prefix.]name:index`. Everything before the first `.` is a
//! namespace prefix and is dropped; the trailing number becomes the call id.

use super::{
    partial_marker_len, ExtractedToolCall, ExtractedToolCalls, ToolCallGrammar, ToolParseError,
};
use crate::translate::anthropic_types::Tool;
use crate::translate::openai_types::{ChunkDelta, ChunkToolCall, ChunkToolCallFunction};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

pub const SECTION_BEGIN: &str = "<|tool_calls_section_begin|>";
pub const SECTION_END: &str = "<|tool_calls_section_end|>";
pub const CALL_BEGIN: &str = "<|tool_call_begin|>";
pub const ARGUMENT_BEGIN: &str = "<|tool_call_argument_begin|>";
pub const CALL_END: &str = "<|tool_call_end|>";

static TOOL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<\|tool_call_begin\|>\s*(?P<header>[\w.-]+:\d+)\s*<\|tool_call_argument_begin\|>\s*(?P<arguments>.*?)\s*<\|tool_call_end\|>",
    )
    .unwrap()
});

/// Split `functions.get_weather:3` into (`get_weather`, `3`).
pub fn parse_header(header: &str) -> (String, String) {
    match header.rsplit_once(':') {
        Some((name_part, id)) => {
            let name = match name_part.split_once('.') {
                Some((_prefix, rest)) => rest,
                None => name_part,
            };
            (name.to_string(), id.to_string())
        }
        None => (header.to_string(), header.to_string()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KimiK2Parser;

impl KimiK2Parser {
    /// Extract every complete tool call from a finished model output.
    pub fn extract_tool_calls(&self, text: &str) -> ExtractedToolCalls {
        let Some(section_start) = text.find(SECTION_BEGIN) else {
            return ExtractedToolCalls {
                content: Some(text.to_string()),
                tool_calls: Vec::new(),
            };
        };

        let tool_calls: Vec<ExtractedToolCall> = TOOL_CALL_RE
            .captures_iter(text)
            .map(|caps| {
                let (name, id) = parse_header(&caps["header"]);
                let raw = &caps["arguments"];
                let arguments = serde_json::from_str(raw)
                    .unwrap_or_else(|_| Value::String(raw.to_string()));
                ExtractedToolCall {
                    id: format!("call_{id}"),
                    name,
                    arguments,
                }
            })
            .collect();

        if tool_calls.is_empty() {
            return ExtractedToolCalls {
                content: Some(text.to_string()),
                tool_calls,
            };
        }

        let leading = text[..section_start].trim();
        ExtractedToolCalls {
            content: (!leading.is_empty()).then(|| leading.to_string()),
            tool_calls,
        }
    }
}

/// Scanner adapter: a whole section, every call's arguments must be a JSON object.
pub(crate) struct KimiK2Grammar;

impl ToolCallGrammar for KimiK2Grammar {
    fn name(&self) -> &'static str {
        "kimi_k2"
    }

    fn start_marker(&self) -> &'static str {
        SECTION_BEGIN
    }

    fn end_marker(&self) -> &'static str {
        SECTION_END
    }

    fn extract(&self, span: &str, _tools: &[Tool]) -> Result<Vec<ExtractedToolCall>, ToolParseError> {
        let extracted = KimiK2Parser.extract_tool_calls(span);
        if !extracted.tools_called() {
            return Err(ToolParseError::Empty);
        }
        if let Some(bad) = extracted.tool_calls.iter().find(|c| !c.arguments.is_object()) {
            return Err(ToolParseError::InvalidArguments {
                name: bad.name.clone(),
            });
        }
        Ok(extracted.tool_calls)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Content,
    Header,
    Arguments { started: bool },
}

/// Incremental extractor fed with successive snapshots of the model output.
///
/// Each call returns the delta that became certain since the previous call:
/// ordinary content with section markers removed, a tool-call header once the
/// argument marker is visible, and argument text as suffix diffs.
#[derive(Debug)]
pub struct KimiK2StreamParser {
    cursor: usize,
    state: StreamState,
    tool_index: u64,
}

impl Default for KimiK2StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl KimiK2StreamParser {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            state: StreamState::Content,
            tool_index: 0,
        }
    }

    /// Number of tool calls whose header has been emitted.
    pub fn tool_calls_started(&self) -> u64 {
        match self.state {
            StreamState::Arguments { .. } => self.tool_index + 1,
            _ => self.tool_index,
        }
    }

    pub fn extract_streaming(&mut self, previous: &str, current: &str) -> Option<ChunkDelta> {
        if previous.is_empty() || self.cursor > current.len() {
            *self = Self::new();
        }

        let mut content = String::new();
        let mut calls: Vec<ChunkToolCall> = Vec::new();

        loop {
            let rest = &current[self.cursor..];
            match self.state {
                StreamState::Content => match rest.find(CALL_BEGIN) {
                    Some(pos) => {
                        content.push_str(&strip_section_markers(&rest[..pos]));
                        self.cursor += pos + CALL_BEGIN.len();
                        self.state = StreamState::Header;
                    }
                    None => {
                        let held = partial_marker_len(rest, &[CALL_BEGIN, SECTION_BEGIN, SECTION_END]);
                        let safe = &rest[..rest.len() - held];
                        // A section marker may still be split; only drop whole ones.
                        content.push_str(&strip_section_markers(safe));
                        self.cursor += safe.len();
                        break;
                    }
                },
                StreamState::Header => match rest.find(ARGUMENT_BEGIN) {
                    Some(pos) => {
                        let (name, id) = parse_header(rest[..pos].trim());
                        calls.push(ChunkToolCall {
                            index: self.tool_index,
                            id: Some(format!("call_{id}")),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        });
                        self.cursor += pos + ARGUMENT_BEGIN.len();
                        self.state = StreamState::Arguments { started: false };
                    }
                    None => break,
                },
                StreamState::Arguments { started } => {
                    let trimmed = if started { rest } else { rest.trim_start() };
                    self.cursor += rest.len() - trimmed.len();

                    match trimmed.find(CALL_END) {
                        Some(pos) => {
                            let tail = trimmed[..pos].trim_end();
                            if !tail.is_empty() {
                                calls.push(self.argument_fragment(tail));
                            }
                            self.cursor += pos + CALL_END.len();
                            self.tool_index += 1;
                            self.state = StreamState::Content;
                        }
                        None => {
                            let held = partial_marker_len(trimmed, &[CALL_END]);
                            let safe = &trimmed[..trimmed.len() - held];
                            if !safe.is_empty() {
                                calls.push(self.argument_fragment(safe));
                                self.cursor += safe.len();
                                self.state = StreamState::Arguments { started: true };
                            }
                            break;
                        }
                    }
                }
            }
        }

        if content.is_empty() && calls.is_empty() {
            return None;
        }
        Some(ChunkDelta {
            content: (!content.is_empty()).then_some(content),
            tool_calls: (!calls.is_empty()).then_some(calls),
            ..Default::default()
        })
    }

    fn argument_fragment(&self, text: &str) -> ChunkToolCall {
        ChunkToolCall {
            index: self.tool_index,
            id: None,
            call_type: None,
            function: Some(ChunkToolCallFunction {
                name: None,
                arguments: Some(text.to_string()),
            }),
        }
    }
}

fn strip_section_markers(text: &str) -> String {
    text.replace(SECTION_BEGIN, "").replace(SECTION_END, "")
}
