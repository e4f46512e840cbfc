//! Qwen3-Coder tool-call markup.
//!
//! ```text
//! <tool_call>
//! <function=get_weather>
//! <parameter=city>
//! Paris
//! </parameter>
//! </function>
//! </tool_call>
//! ```

use super::{
    escape_json_fragment, partial_marker_len, ExtractedToolCall, ExtractedToolCalls,
    ToolCallGrammar, ToolParseError,
};
use crate::translate::anthropic_types::Tool;
use crate::translate::openai_types::{ChunkDelta, ChunkToolCall, ChunkToolCallFunction};
use crate::translate::schema::find_tool_schema;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;

pub const TOOL_CALL_START: &str = "<tool_call>";
pub const TOOL_CALL_END: &str = "</tool_call>";
pub const FUNCTION_PREFIX: &str = "<function=";
pub const FUNCTION_END: &str = "</function>";
pub const PARAMETER_PREFIX: &str = "<parameter=";
pub const PARAMETER_END: &str = "</parameter>";

static COMPLETE_TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").unwrap());
static OPEN_TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>(.*)$").unwrap());
static FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function=(.*?)</function>|<function=(.*)$").unwrap());
static PARAMETER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<parameter=(.*?)</parameter>|<parameter=(.*?)$").unwrap());

pub fn generate_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

/// Drop at most one leading and one trailing newline.
fn trim_one_newline(value: &str) -> &str {
    let value = value.strip_prefix('\n').unwrap_or(value);
    value.strip_suffix('\n').unwrap_or(value)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Qwen3CoderParser;

impl Qwen3CoderParser {
    /// Extract every tool call from a finished model output, converting
    /// parameter values with the originating tool's schema.
    pub fn extract_tool_calls(&self, text: &str, tools: &[Tool]) -> ExtractedToolCalls {
        if !text.contains(FUNCTION_PREFIX) {
            return ExtractedToolCalls {
                content: Some(text.to_string()),
                tool_calls: Vec::new(),
            };
        }

        let tool_calls: Vec<ExtractedToolCall> = function_bodies(text)
            .into_iter()
            .filter_map(|body| parse_function(body, tools))
            .collect();

        if tool_calls.is_empty() {
            return ExtractedToolCalls {
                content: Some(text.to_string()),
                tool_calls,
            };
        }

        let content_end = text
            .find(TOOL_CALL_START)
            .or_else(|| text.find(FUNCTION_PREFIX))
            .unwrap_or(0);
        let leading = &text[..content_end];
        ExtractedToolCalls {
            content: (!leading.is_empty()).then(|| leading.to_string()),
            tool_calls,
        }
    }
}

/// Raw `NAME>...` bodies of every function inside the tool-call wrappers.
fn function_bodies(text: &str) -> Vec<&str> {
    let mut wrappers: Vec<&str> = COMPLETE_TOOL_CALL_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if wrappers.is_empty() {
        wrappers = OPEN_TOOL_CALL_RE
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
    }

    wrappers
        .into_iter()
        .flat_map(|wrapper| {
            FUNCTION_RE
                .captures_iter(wrapper)
                .filter_map(|c| c.get(1).or_else(|| c.get(2)).map(|m| m.as_str()))
                .collect::<Vec<_>>()
        })
        .filter(|body| !body.trim().is_empty())
        .collect()
}

fn parse_function(body: &str, tools: &[Tool]) -> Option<ExtractedToolCall> {
    let (name, params) = body.split_once('>')?;
    let name = name.trim();
    let properties = find_tool_schema(name, tools)
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object);
    if properties.is_none() {
        tracing::warn!(tool = name, "Tool is not declared in the request, parameters stay strings");
    }

    let mut arguments = Map::new();
    for caps in PARAMETER_RE.captures_iter(params) {
        let Some(matched) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let Some((param, raw)) = matched.as_str().split_once('>') else {
            continue;
        };
        let value = trim_one_newline(raw);
        let schema = properties.and_then(|p| p.get(param));
        arguments.insert(param.to_string(), convert_param(value, param, schema, name));
    }

    Some(ExtractedToolCall {
        id: generate_call_id(),
        name: name.to_string(),
        arguments: Value::Object(arguments),
    })
}

fn convert_param(value: &str, param: &str, schema: Option<&Value>, tool: &str) -> Value {
    if value.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    let declared = schema
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("string");

    let converted = match declared {
        "number" => value
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        "integer" => value.trim().parse::<i64>().ok().map(|i| Value::Number(i.into())),
        "boolean" => Some(Value::Bool(value.eq_ignore_ascii_case("true"))),
        _ => Some(Value::String(value.to_string())),
    };

    converted.unwrap_or_else(|| {
        tracing::warn!(tool, parameter = param, param_type = declared, "Failed to convert parameter, keeping string");
        Value::String(value.to_string())
    })
}

/// Scanner adapter over one `<tool_call>` span.
pub(crate) struct Qwen3CoderGrammar;

impl ToolCallGrammar for Qwen3CoderGrammar {
    fn name(&self) -> &'static str {
        "qwen3_coder"
    }

    fn start_marker(&self) -> &'static str {
        TOOL_CALL_START
    }

    fn end_marker(&self) -> &'static str {
        TOOL_CALL_END
    }

    fn extract(&self, span: &str, tools: &[Tool]) -> Result<Vec<ExtractedToolCall>, ToolParseError> {
        let extracted = Qwen3CoderParser.extract_tool_calls(span, tools);
        if extracted.tools_called() {
            Ok(extracted.tool_calls)
        } else {
            Err(ToolParseError::Empty)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Content,
    AwaitFunction,
    FunctionName,
    InFunction,
    ParamName,
    ParamValue { started: bool },
    AfterFunction,
}

/// Incremental extractor producing OpenAI-style tool-call deltas.
///
/// Arguments are assembled as a JSON object text: `{`, then one
/// `"name": "value"` pair per parameter, then `}`. Values are always
/// emitted as JSON strings here; only whole-text extraction applies
/// schema types.
#[derive(Debug)]
pub struct Qwen3CoderStreamParser {
    cursor: usize,
    state: StreamState,
    tool_index: u64,
    param_count: usize,
    in_tool_call: bool,
}

impl Default for Qwen3CoderStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Qwen3CoderStreamParser {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            state: StreamState::Content,
            tool_index: 0,
            param_count: 0,
            in_tool_call: false,
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
                StreamState::Content => {
                    let next = [TOOL_CALL_START, FUNCTION_PREFIX]
                        .into_iter()
                        .filter_map(|m| rest.find(m).map(|pos| (pos, m)))
                        .min_by_key(|(pos, _)| *pos);
                    match next {
                        Some((pos, marker)) => {
                            content.push_str(&rest[..pos]);
                            self.cursor += pos + marker.len();
                            if marker == TOOL_CALL_START {
                                self.in_tool_call = true;
                                self.state = StreamState::AwaitFunction;
                            } else {
                                self.state = StreamState::FunctionName;
                            }
                        }
                        None => {
                            let held = partial_marker_len(rest, &[TOOL_CALL_START, FUNCTION_PREFIX]);
                            content.push_str(&rest[..rest.len() - held]);
                            self.cursor += rest.len() - held;
                            break;
                        }
                    }
                }
                StreamState::AwaitFunction => {
                    if let Some(pos) = rest.find(FUNCTION_PREFIX) {
                        self.cursor += pos + FUNCTION_PREFIX.len();
                        self.state = StreamState::FunctionName;
                    } else if let Some(pos) = rest.find(TOOL_CALL_END) {
                        // Wrapper without a function: nothing to report.
                        self.cursor += pos + TOOL_CALL_END.len();
                        self.in_tool_call = false;
                        self.state = StreamState::Content;
                    } else {
                        break;
                    }
                }
                StreamState::FunctionName => match rest.find('>') {
                    Some(pos) => {
                        let name = rest[..pos].trim().to_string();
                        calls.push(ChunkToolCall {
                            index: self.tool_index,
                            id: Some(generate_call_id()),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        });
                        calls.push(self.argument_fragment("{".to_string()));
                        self.param_count = 0;
                        self.cursor += pos + 1;
                        self.state = StreamState::InFunction;
                    }
                    None => break,
                },
                StreamState::InFunction => {
                    let param = rest.find(PARAMETER_PREFIX);
                    let end = rest.find(FUNCTION_END);
                    match (param, end) {
                        (Some(p), e) if e.map_or(true, |e| p < e) => {
                            self.cursor += p + PARAMETER_PREFIX.len();
                            self.state = StreamState::ParamName;
                        }
                        (_, Some(e)) => {
                            calls.push(self.argument_fragment("}".to_string()));
                            self.cursor += e + FUNCTION_END.len();
                            self.tool_index += 1;
                            self.state = StreamState::AfterFunction;
                        }
                        _ => break,
                    }
                }
                StreamState::ParamName => match rest.find('>') {
                    Some(pos) => {
                        let name = rest[..pos].trim();
                        let separator = if self.param_count > 0 { ", " } else { "" };
                        let key = Value::String(name.to_string()).to_string();
                        calls.push(self.argument_fragment(format!("{separator}{key}: \"")));
                        self.param_count += 1;
                        self.cursor += pos + 1;
                        self.state = StreamState::ParamValue { started: false };
                    }
                    None => break,
                },
                StreamState::ParamValue { started } => {
                    let mut value = rest;
                    if !started {
                        if value.is_empty() {
                            break;
                        }
                        if let Some(stripped) = value.strip_prefix('\n') {
                            value = stripped;
                            self.cursor += 1;
                        }
                        self.state = StreamState::ParamValue { started: true };
                    }

                    // A value ends at its closing tag, or implicitly where the
                    // next parameter or the function end begins.
                    let terminator = [PARAMETER_END, PARAMETER_PREFIX, FUNCTION_END]
                        .into_iter()
                        .filter_map(|m| value.find(m).map(|pos| (pos, m)))
                        .min_by_key(|(pos, _)| *pos);

                    match terminator {
                        Some((pos, marker)) => {
                            let raw = &value[..pos];
                            let raw = raw.strip_suffix('\n').unwrap_or(raw);
                            calls.push(self.argument_fragment(format!(
                                "{}\"",
                                escape_json_fragment(raw)
                            )));
                            self.cursor += pos;
                            if marker == PARAMETER_END {
                                self.cursor += PARAMETER_END.len();
                            }
                            self.state = StreamState::InFunction;
                        }
                        None => {
                            let held =
                                partial_marker_len(value, &[PARAMETER_END, PARAMETER_PREFIX, FUNCTION_END]);
                            let safe = &value[..value.len() - held];
                            // The newline before a closing tag is not part of the value.
                            let safe = safe.strip_suffix('\n').unwrap_or(safe);
                            if !safe.is_empty() {
                                calls.push(self.argument_fragment(escape_json_fragment(safe)));
                                self.cursor += safe.len();
                            }
                            break;
                        }
                    }
                }
                StreamState::AfterFunction => {
                    let trimmed = rest.trim_start();
                    if self.in_tool_call && trimmed.starts_with(TOOL_CALL_END) {
                        self.cursor += rest.len() - trimmed.len() + TOOL_CALL_END.len();
                        self.in_tool_call = false;
                        self.state = StreamState::Content;
                    } else if self.in_tool_call && trimmed.starts_with(FUNCTION_PREFIX) {
                        // Another function inside the same wrapper.
                        self.cursor += rest.len() - trimmed.len() + FUNCTION_PREFIX.len();
                        self.state = StreamState::FunctionName;
                    } else if self.in_tool_call
                        && (TOOL_CALL_END.starts_with(trimmed) || FUNCTION_PREFIX.starts_with(trimmed))
                    {
                        break;
                    } else {
                        self.in_tool_call = false;
                        self.state = StreamState::Content;
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

    fn argument_fragment(&self, text: String) -> ChunkToolCall {
        ChunkToolCall {
            index: self.tool_index,
            id: None,
            call_type: None,
            function: Some(ChunkToolCallFunction {
                name: None,
                arguments: Some(text),
            }),
        }
    }
}
