//! Translate Anthropic Messages API requests into `OpenAI` Chat Completions requests.
//!
//! Handles system messages, multi-part content (text, images), tool use, tool results,
//! and tool choice mapping. A single Anthropic message can expand into multiple `OpenAI`
//! messages (a user message with `tool_result` blocks becomes separate `tool`-role
//! messages followed by the user's own text).

use serde_json::{Map, Value};

use super::anthropic_types::{
    ContentBlock, Message, MessagesRequest, Role, ToolChoice, ToolChoiceAuto, ToolChoiceSpecific,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatRole, ChatTool,
    ChatToolCall, ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction,
    ChatToolChoiceSpecific, ContentPart, ImageUrlDetail, StreamOptions,
};
use crate::config::ProviderConfig;

/// The translated request plus provider-specific top-level body fields.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub request: ChatCompletionRequest,
    pub extra_body: Map<String, Value>,
}

impl UpstreamRequest {
    /// JSON body to POST: the request with `extra_body` merged over it.
    pub fn into_payload(self) -> serde_json::Result<Value> {
        let mut payload = serde_json::to_value(self.request)?;
        if let Value::Object(ref mut fields) = payload {
            fields.extend(self.extra_body);
        }
        Ok(payload)
    }

    pub fn is_streaming(&self) -> bool {
        self.request.stream.unwrap_or(false)
    }
}

/// Translate an Anthropic Messages API request into an `OpenAI` Chat Completions request.
/// Pure function: the target model has already been resolved by the router.
pub fn anthropic_to_openai(req: &MessagesRequest, target_model: &str) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(ref system) = req.system {
        let text = system.as_text();
        if !text.trim().is_empty() {
            messages.push(ChatMessage::text(ChatRole::System, text));
        }
    }

    for msg in &req.messages {
        messages.extend(translate_message(msg));
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().map(translate_tool_choice);

    let stream_options = req.is_streaming().then_some(StreamOptions {
        include_usage: true,
    });

    let user = req.metadata.as_ref().and_then(|m| m.user_id.clone());

    ChatCompletionRequest {
        model: target_model.to_string(),
        messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options,
        tools,
        tool_choice,
        stop: req.stop_sequences.clone(),
        user,
    }
}

/// Translate for a concrete provider: reasoning parameters and the
/// `max_tokens` ceiling come from its configuration.
pub fn build_upstream_request(
    req: &MessagesRequest,
    target_model: &str,
    provider: &ProviderConfig,
) -> UpstreamRequest {
    let mut request = anthropic_to_openai(req, target_model);
    let mut extra_body = Map::new();

    if req.thinking_requested() {
        if provider.supports_reasoning {
            let reasoning = &provider.reasoning_config;
            if let (Some(param), Some(budget)) =
                (reasoning.thinking_budget_param.as_ref(), req.thinking_budget())
            {
                extra_body.insert(param.clone(), Value::from(budget));
            }
            if reasoning.include_reasoning {
                extra_body.insert("include_reasoning".to_string(), Value::Bool(true));
            }
        } else {
            tracing::warn!(
                provider = %provider.key,
                model = %req.model,
                "Thinking requested but provider does not support reasoning, continuing without it"
            );
        }
    }

    if let Some(limit) = provider.max_tokens_override {
        if request.max_tokens.map_or(true, |requested| requested > limit) {
            tracing::info!(
                provider = %provider.key,
                requested = ?request.max_tokens,
                limit,
                "Clamping max_tokens to provider override"
            );
            request.max_tokens = Some(limit);
        }
    }

    UpstreamRequest {
        request,
        extra_body,
    }
}

fn translate_message(msg: &Message) -> Vec<ChatMessage> {
    let blocks = msg.content.blocks();

    match msg.role {
        Role::User => translate_user_message(&blocks),
        Role::Assistant => translate_assistant_message(&blocks).into_iter().collect(),
    }
}

fn translate_user_message(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut texts: Vec<&str> = Vec::new();
    let mut images: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::Image { source } => {
                images.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: format!("data:{};base64,{}", source.media_type, source.data),
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let result_text = content.as_ref().map(|c| c.as_text()).unwrap_or_default();
                messages.push(ChatMessage {
                    role: ChatRole::Tool,
                    content: Some(ChatContent::Text(result_text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                });
            }
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } | ContentBlock::Unsupported => {}
        }
    }

    let text = texts.join("\n");
    if images.is_empty() {
        if !text.is_empty() {
            messages.push(ChatMessage::text(ChatRole::User, text));
        }
    } else {
        let mut parts = Vec::with_capacity(images.len() + 1);
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        parts.extend(images);
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: Some(ChatContent::Parts(parts)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }

    messages
}

fn translate_assistant_message(blocks: &[ContentBlock]) -> Option<ChatMessage> {
    let mut texts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
            ContentBlock::Thinking { .. }
            | ContentBlock::Image { .. }
            | ContentBlock::ToolResult { .. }
            | ContentBlock::Unsupported => {}
        }
    }

    let text = texts.join("\n");
    if text.is_empty() && tool_calls.is_empty() {
        return None;
    }

    Some(ChatMessage {
        role: ChatRole::Assistant,
        content: (!text.is_empty()).then_some(ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        name: None,
    })
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto(ToolChoiceAuto { choice_type }) => match choice_type.as_str() {
            "any" => ChatToolChoice::String("required".to_string()),
            "none" => ChatToolChoice::String("none".to_string()),
            _ => ChatToolChoice::String("auto".to_string()),
        },
        ToolChoice::Specific(ToolChoiceSpecific { name, .. }) => {
            ChatToolChoice::Specific(ChatToolChoiceSpecific {
                choice_type: "function".to_string(),
                function: ChatToolChoiceFunction { name: name.clone() },
            })
        }
    }
}
