//! State machine for translating OpenAI streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] processes OpenAI `ChatCompletionChunk`s one at a time and
//! emits the corresponding Anthropic stream events. At most one content block is open
//! at a time; opening a new one closes the previous. Block indices are handed out
//! sequentially from 0 and every opened block is stopped exactly once.
//!
//! Three sources produce `tool_use` blocks:
//! - native `tool_calls` deltas, whose arguments are buffered and emitted once at close,
//! - Kimi-K2 markup embedded in `content`,
//! - Qwen3-Coder markup embedded in `content`.
//!
//! Embedded markup is only acted on once a complete span has arrived; until then the
//! unresolved tail of the text stays in a scan buffer.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesRequest, MessagesResponse, ResponseContentBlock,
    StreamEvent, Tool, Usage,
};
use super::openai_types::{ChatCompletionChunk, ChatUsage, ChunkToolCall};
use super::schema::coerce_arguments;
use super::tool_parsers::{ExtractedToolCall, Extraction, ToolCallScanner};
use super::{final_stop_reason, thinking_signature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug)]
struct ActiveBlock {
    index: usize,
    kind: BlockKind,
    content: String,
    /// Upstream parallel-call slot this tool block belongs to.
    tool_slot: Option<u64>,
}

/// Bookkeeping for one native tool call, keyed by its upstream slot index.
#[derive(Debug)]
struct ToolSlot {
    id: String,
    name: String,
    argument_buffer: String,
    /// Decided on the first non-empty argument fragment.
    is_escaped_json_string: Option<bool>,
}

/// State machine that translates OpenAI streaming chunks into Anthropic SSE events.
///
/// Usage:
///   let mut translator = StreamTranslator::new("msg_1", "claude-sonnet-4", tools);
///   let mut events = translator.start();
///   for chunk in openai_chunks {
///       events.extend(translator.process_chunk(&chunk));
///   }
///   events.extend(translator.finalize());
#[derive(Debug)]
pub struct StreamTranslator {
    msg_id: String,
    model: String,
    tools: Vec<Tool>,
    scanner: ToolCallScanner,
    started: bool,
    finalized: bool,
    next_block_index: usize,
    active: Option<ActiveBlock>,
    tool_slots: HashMap<u64, ToolSlot>,
    text_buffer: String,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    finish_reason: Option<String>,
    produced_tool_call: bool,
}

impl StreamTranslator {
    pub fn new(msg_id: impl Into<String>, model: impl Into<String>, tools: Vec<Tool>) -> Self {
        Self {
            msg_id: msg_id.into(),
            model: model.into(),
            tools,
            scanner: ToolCallScanner::default(),
            started: false,
            finalized: false,
            next_block_index: 0,
            active: None,
            tool_slots: HashMap::new(),
            text_buffer: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            finish_reason: None,
            produced_tool_call: false,
        }
    }

    /// Translator answering `req`: reports the inbound model name and
    /// coerces tool arguments against the request's tool schemas.
    pub fn for_request(req: &MessagesRequest, msg_id: impl Into<String>) -> Self {
        Self::new(msg_id, req.model.clone(), req.tools().to_vec())
    }

    pub fn message_id(&self) -> &str {
        &self.msg_id
    }

    /// Latest usage counters reported upstream.
    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
        }
    }

    /// Emit `message_start`. Only the first call produces an event.
    pub fn start(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }]
    }

    /// Process a single OpenAI streaming chunk, returning zero or more Anthropic SSE events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.finalized {
            return Vec::new();
        }

        let mut events = self.start();

        if let Some(ref usage) = chunk.usage {
            self.record_usage(usage);
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(ref reason) = choice.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
            if !reasoning.is_empty() {
                events.extend(self.flush_held_text());
                events.extend(self.ensure_block(
                    BlockKind::Thinking,
                    ResponseContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                ));
                if let Some(active) = self.active.as_mut() {
                    active.content.push_str(reasoning);
                    events.push(StreamEvent::ContentBlockDelta {
                        index: active.index,
                        delta: Delta::ThinkingDelta {
                            thinking: reasoning.to_string(),
                        },
                    });
                }
            }
        }

        if let Some(ref tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                events.extend(self.process_tool_call(tc));
            }
        }

        if let Some(content) = choice.delta.content.as_deref() {
            if !content.is_empty() {
                if self.active_kind() == Some(BlockKind::ToolUse) {
                    events.extend(self.close_active());
                }
                self.text_buffer.push_str(content);
                events.extend(self.drain_text_buffer());
            }
        }

        events
    }

    /// Flush buffered text, close the open block and emit the closing
    /// `message_delta` + `message_stop`. A second call yields nothing.
    pub fn finalize(&mut self) -> Vec<StreamEvent> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;

        let mut events = self.start();

        events.extend(self.drain_text_buffer());
        // Whatever is left is a marker that never completed: keep it as text.
        let rest = std::mem::take(&mut self.text_buffer);
        events.extend(self.emit_text(rest));
        events.extend(self.close_active());

        let stop_reason = final_stop_reason(self.finish_reason.as_deref(), self.produced_tool_call);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.output_tokens,
                input_tokens: Some(self.input_tokens),
                cache_creation_input_tokens: self.cache_creation_input_tokens,
                cache_read_input_tokens: self.cache_read_input_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);

        events
    }

    /// Usage fields present on a chunk replace the running values.
    fn record_usage(&mut self, usage: &ChatUsage) {
        if let Some(prompt) = usage.prompt_tokens {
            self.input_tokens = prompt;
        }
        if let Some(completion) = usage.completion_tokens {
            self.output_tokens = completion;
        }
        if let Some(cached) = usage.cached_tokens() {
            self.cache_read_input_tokens = Some(cached);
        }
        if let Some(created) = usage.cache_creation_input_tokens {
            self.cache_creation_input_tokens = Some(created);
        }
    }

    fn process_tool_call(&mut self, tc: &ChunkToolCall) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let name = tc
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .filter(|n| !n.is_empty());

        if let (Some(id), Some(name)) = (tc.id.as_deref(), name) {
            // Some providers repeat id and name on every fragment. Same slot and
            // same id as the open block continues that call rather than opening a new one.
            let repeated = self.active_tool_slot() == Some(tc.index)
                && self.tool_slots.get(&tc.index).is_some_and(|s| s.id == id);
            if !repeated {
                events.extend(self.flush_held_text());
                events.extend(self.close_active());
                self.tool_slots.insert(
                    tc.index,
                    ToolSlot {
                        id: id.to_string(),
                        name: name.to_string(),
                        argument_buffer: String::new(),
                        is_escaped_json_string: None,
                    },
                );
                events.push(self.open_block(
                    BlockKind::ToolUse,
                    ResponseContentBlock::ToolUse {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: json!({}),
                    },
                    Some(tc.index),
                ));
                self.produced_tool_call = true;
            }
        }

        let Some(args) = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty())
        else {
            return events;
        };

        if self.active_tool_slot() != Some(tc.index) {
            tracing::warn!(
                slot = tc.index,
                active_slot = ?self.active_tool_slot(),
                "Dropping arguments for a tool call that is not the open block"
            );
            return events;
        }

        if let Some(slot) = self.tool_slots.get_mut(&tc.index) {
            if slot.is_escaped_json_string.is_none() {
                slot.is_escaped_json_string = Some(args.starts_with('"'));
            }
            slot.argument_buffer.push_str(args);
        }

        events
    }

    /// Emit every complete span in the scan buffer; keep the unresolved tail.
    fn drain_text_buffer(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            let extraction = self.scanner.scan(&self.text_buffer, &self.tools);
            match extraction {
                Extraction::PlainText { safe_len } => {
                    let text: String = self.text_buffer.drain(..safe_len).collect();
                    events.extend(self.emit_text(text));
                    break;
                }
                Extraction::Incomplete { leading } => {
                    let text: String = self.text_buffer.drain(..leading).collect();
                    events.extend(self.emit_text(text));
                    break;
                }
                Extraction::ToolCallFound {
                    leading,
                    calls,
                    consumed,
                } => {
                    let text: String = self.text_buffer.drain(..leading).collect();
                    self.text_buffer.drain(..consumed - leading);
                    events.extend(self.emit_text(text));
                    for call in calls {
                        events.extend(self.emit_synthetic_tool_call(call));
                    }
                }
                Extraction::Literal { consumed } => {
                    let text: String = self.text_buffer.drain(..consumed).collect();
                    events.extend(self.emit_text(text));
                }
            }
        }
        events
    }

    /// Text held back as a possible marker precedes any structured block that
    /// follows it, so it goes out as literal text first.
    fn flush_held_text(&mut self) -> Vec<StreamEvent> {
        let held = std::mem::take(&mut self.text_buffer);
        self.emit_text(held)
    }

    fn emit_text(&mut self, text: String) -> Vec<StreamEvent> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut events = self.ensure_block(
            BlockKind::Text,
            ResponseContentBlock::Text {
                text: String::new(),
            },
        );
        if let Some(active) = self.active.as_mut() {
            active.content.push_str(&text);
            events.push(StreamEvent::ContentBlockDelta {
                index: active.index,
                delta: Delta::TextDelta { text },
            });
        }
        events
    }

    /// A tool call recovered from embedded markup: start, one delta, stop.
    fn emit_synthetic_tool_call(&mut self, call: ExtractedToolCall) -> Vec<StreamEvent> {
        let mut events = self.close_active();
        let arguments = coerce_arguments(&call.name, call.arguments, &self.tools);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.produced_tool_call = true;

        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: json!({}),
            },
        });
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: arguments.to_string(),
            },
        });
        events.push(StreamEvent::ContentBlockStop { index });
        events
    }

    /// Keep the open block if it is of `kind`, otherwise replace it with a fresh one.
    fn ensure_block(&mut self, kind: BlockKind, content_block: ResponseContentBlock) -> Vec<StreamEvent> {
        if self.active_kind() == Some(kind) {
            return Vec::new();
        }
        let mut events = self.close_active();
        events.push(self.open_block(kind, content_block, None));
        events
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        content_block: ResponseContentBlock,
        tool_slot: Option<u64>,
    ) -> StreamEvent {
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.active = Some(ActiveBlock {
            index,
            kind,
            content: String::new(),
            tool_slot,
        });
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        }
    }

    fn close_active(&mut self) -> Vec<StreamEvent> {
        let Some(block) = self.active.take() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        match block.kind {
            BlockKind::ToolUse => {
                let partial_json = block
                    .tool_slot
                    .and_then(|slot| self.tool_slots.get(&slot))
                    .map_or_else(|| "{}".to_string(), |slot| self.final_arguments(slot));
                events.push(StreamEvent::ContentBlockDelta {
                    index: block.index,
                    delta: Delta::InputJsonDelta { partial_json },
                });
            }
            BlockKind::Thinking => {
                events.push(StreamEvent::ContentBlockDelta {
                    index: block.index,
                    delta: Delta::SignatureDelta {
                        signature: thinking_signature(&block.content),
                    },
                });
            }
            BlockKind::Text => {}
        }
        events.push(StreamEvent::ContentBlockStop { index: block.index });
        events
    }

    /// Decode a native tool call's buffered arguments into canonical JSON text.
    fn final_arguments(&self, slot: &ToolSlot) -> String {
        let buffer = slot.argument_buffer.trim();
        if buffer.is_empty() {
            return "{}".to_string();
        }

        let escaped = slot.is_escaped_json_string == Some(true);
        let decoded = if escaped {
            decode_escaped(buffer).or_else(|_| serde_json::from_str::<Value>(buffer))
        } else {
            serde_json::from_str::<Value>(buffer).or_else(|_| decode_escaped(buffer))
        };

        match decoded {
            Ok(args) => coerce_arguments(&slot.name, args, &self.tools).to_string(),
            Err(e) => {
                tracing::error!(
                    tool = %slot.name,
                    id = %slot.id,
                    error = %e,
                    "Failed to decode tool arguments"
                );
                json!({"error": "Failed to decode arguments", "raw": buffer}).to_string()
            }
        }
    }

    fn active_kind(&self) -> Option<BlockKind> {
        self.active.as_ref().map(|b| b.kind)
    }

    fn active_tool_slot(&self) -> Option<u64> {
        self.active
            .as_ref()
            .filter(|b| b.kind == BlockKind::ToolUse)
            .and_then(|b| b.tool_slot)
    }
}

/// A JSON string whose content is itself JSON.
fn decode_escaped(buffer: &str) -> serde_json::Result<Value> {
    let inner: String = serde_json::from_str(buffer)?;
    serde_json::from_str(&inner)
}
