//! Extraction of tool calls that models emit as plain text.
//!
//! Some open-weight models do not use the structured `tool_calls` field and
//! instead write their own markup into `content`. Each markup is a
//! [`ToolCallGrammar`]; the [`ToolCallScanner`] finds the earliest complete
//! span of any known grammar in a text buffer and reports what the caller may
//! safely emit. Both response translators drive the scanner and never look at
//! grammar details themselves.

pub mod kimi_k2;
pub mod qwen3_coder;

use super::anthropic_types::Tool;
use serde_json::Value;
use thiserror::Error;

pub use kimi_k2::{KimiK2Parser, KimiK2StreamParser};
pub use qwen3_coder::{Qwen3CoderParser, Qwen3CoderStreamParser};

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of whole-text extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedToolCalls {
    /// Text preceding the first tool call, if any.
    pub content: Option<String>,
    pub tool_calls: Vec<ExtractedToolCall>,
}

impl ExtractedToolCalls {
    pub fn tools_called(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum ToolParseError {
    #[error("no tool call found in span")]
    Empty,

    #[error("arguments for '{name}' are not a JSON object")]
    InvalidArguments { name: String },
}

pub trait ToolCallGrammar: Send + Sync {
    fn name(&self) -> &'static str;

    fn start_marker(&self) -> &'static str;

    fn end_marker(&self) -> &'static str;

    /// Parse a complete span, markers included.
    fn extract(&self, span: &str, tools: &[Tool]) -> Result<Vec<ExtractedToolCall>, ToolParseError>;
}

/// What the caller may do with the front of its buffer.
#[derive(Debug)]
pub enum Extraction {
    /// No start marker. `buffer[..safe_len]` is plain text; the rest might be
    /// the beginning of a marker and must wait for more input.
    PlainText { safe_len: usize },
    /// A start marker at `leading` has no end marker yet.
    Incomplete { leading: usize },
    /// `buffer[..leading]` is plain text, followed by a span of `consumed - leading`
    /// bytes that yielded `calls`.
    ToolCallFound {
        leading: usize,
        calls: Vec<ExtractedToolCall>,
        consumed: usize,
    },
    /// A complete span failed to parse; `buffer[..consumed]` is literal text.
    Literal { consumed: usize },
}

pub struct ToolCallScanner {
    grammars: Vec<Box<dyn ToolCallGrammar>>,
}

impl Default for ToolCallScanner {
    fn default() -> Self {
        Self::new(vec![
            Box::new(qwen3_coder::Qwen3CoderGrammar),
            Box::new(kimi_k2::KimiK2Grammar),
        ])
    }
}

impl std::fmt::Debug for ToolCallScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.grammars.iter().map(|g| g.name()))
            .finish()
    }
}

impl ToolCallScanner {
    pub fn new(grammars: Vec<Box<dyn ToolCallGrammar>>) -> Self {
        Self { grammars }
    }

    pub fn scan(&self, buffer: &str, tools: &[Tool]) -> Extraction {
        let earliest = self
            .grammars
            .iter()
            .filter_map(|g| buffer.find(g.start_marker()).map(|pos| (pos, g)))
            .min_by_key(|(pos, _)| *pos);

        let Some((start, grammar)) = earliest else {
            let starts: Vec<&str> = self.grammars.iter().map(|g| g.start_marker()).collect();
            return Extraction::PlainText {
                safe_len: buffer.len() - partial_marker_len(buffer, &starts),
            };
        };

        let body_start = start + grammar.start_marker().len();
        let Some(end_rel) = buffer[body_start..].find(grammar.end_marker()) else {
            return Extraction::Incomplete { leading: start };
        };
        let consumed = body_start + end_rel + grammar.end_marker().len();
        let span = &buffer[start..consumed];

        match grammar.extract(span, tools) {
            Ok(calls) if !calls.is_empty() => Extraction::ToolCallFound {
                leading: start,
                calls,
                consumed,
            },
            Ok(_) => Extraction::Literal { consumed },
            Err(e) => {
                tracing::warn!(grammar = grammar.name(), error = %e, "Could not parse embedded tool call, treating as text");
                Extraction::Literal { consumed }
            }
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of one of `markers`.
pub(crate) fn partial_marker_len(text: &str, markers: &[&str]) -> usize {
    let longest = markers.iter().map(|m| m.len()).max().unwrap_or(0);
    let max_len = longest.saturating_sub(1).min(text.len());
    (1..=max_len)
        .rev()
        .find(|&len| {
            let cut = text.len() - len;
            text.is_char_boundary(cut)
                && markers
                    .iter()
                    .any(|m| m.len() > len && m.starts_with(&text[cut..]))
        })
        .unwrap_or(0)
}

/// Render raw text as the inside of a JSON string literal.
pub(crate) fn escape_json_fragment(raw: &str) -> String {
    let quoted = Value::String(raw.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}
