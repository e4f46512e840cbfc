use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use claude_bridge::config::ProxyConfig;
use claude_bridge::proxy::translate_sse_stream;
use claude_bridge::router::{estimate_context_length, ProviderRouter};
use claude_bridge::translate::anthropic_types::*;
use claude_bridge::translate::openai_types::{ChatCompletionChunk, ChunkDelta};
use claude_bridge::translate::streaming::StreamTranslator;
use claude_bridge::translate::thinking_signature;
use claude_bridge::translate::tool_parsers::{KimiK2StreamParser, Qwen3CoderStreamParser};
use claude_bridge::{build_router, AppState, SharedLogger};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;

// ────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────

fn chunk(delta: Value, finish_reason: Option<&str>) -> ChatCompletionChunk {
    serde_json::from_value(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 0,
        "model": "upstream",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    }))
    .unwrap()
}

fn delta_chunk(delta: ChunkDelta) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chatcmpl-1".to_string(),
        choices: vec![claude_bridge::translate::openai_types::ChunkChoice {
            index: 0,
            delta,
            finish_reason: None,
        }],
        ..Default::default()
    }
}

fn run(translator: &mut StreamTranslator, chunks: &[ChatCompletionChunk]) -> Vec<StreamEvent> {
    let mut events = translator.start();
    for c in chunks {
        events.extend(translator.process_chunk(c));
    }
    events.extend(translator.finalize());
    events
}

fn weather_tools() -> Vec<Tool> {
    serde_json::from_value(json!([{
        "name": "get_weather",
        "input_schema": {
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "integer"}
            }
        }
    }]))
    .unwrap()
}

struct OpenBlock {
    index: usize,
    is_tool: bool,
    is_thinking: bool,
    json: String,
    last_was_signature: bool,
}

/// Check block sequencing: contiguous indices, one start and one stop per
/// block, valid JSON per tool block, a signature right before each thinking stop.
fn assert_well_formed(events: &[StreamEvent]) {
    assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    assert!(matches!(events[events.len() - 2], StreamEvent::MessageDelta { .. }));
    assert_eq!(
        events.iter().filter(|e| matches!(e, StreamEvent::MessageStart { .. })).count(),
        1
    );

    let mut next_index = 0;
    let mut open: Option<OpenBlock> = None;

    for event in events {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                assert!(open.is_none(), "block {index} opened while another is open");
                assert_eq!(*index, next_index);
                next_index += 1;
                open = Some(OpenBlock {
                    index: *index,
                    is_tool: matches!(content_block, ResponseContentBlock::ToolUse { .. }),
                    is_thinking: matches!(content_block, ResponseContentBlock::Thinking { .. }),
                    json: String::new(),
                    last_was_signature: false,
                });
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let block = open.as_mut().expect("delta outside of a block");
                assert_eq!(block.index, *index);
                block.last_was_signature = matches!(delta, Delta::SignatureDelta { .. });
                if let Delta::InputJsonDelta { partial_json } = delta {
                    block.json.push_str(partial_json);
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                let block = open.take().expect("stop without start");
                assert_eq!(block.index, *index);
                if block.is_tool {
                    serde_json::from_str::<Value>(&block.json)
                        .unwrap_or_else(|e| panic!("tool block {index} has invalid JSON {:?}: {e}", block.json));
                }
                if block.is_thinking {
                    assert!(block.last_was_signature, "thinking block {index} closed without signature");
                }
            }
            _ => {}
        }
    }
    assert!(open.is_none());
}

fn tool_inputs(events: &[StreamEvent]) -> Vec<(String, Value)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for event in events {
        match event {
            StreamEvent::ContentBlockStart {
                content_block: ResponseContentBlock::ToolUse { name, .. },
                ..
            } => out.push((name.clone(), String::new())),
            StreamEvent::ContentBlockDelta {
                delta: Delta::InputJsonDelta { partial_json },
                ..
            } => out.last_mut().unwrap().1.push_str(partial_json),
            _ => {}
        }
    }
    out.into_iter()
        .map(|(name, raw)| (name, serde_json::from_str(&raw).unwrap()))
        .collect()
}

fn text_of(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: Delta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn stop_reason(events: &[StreamEvent]) -> Option<String> {
    events.iter().find_map(|e| match e {
        StreamEvent::MessageDelta { delta, .. } => delta.stop_reason.clone(),
        _ => None,
    })
}

// ────────────────────────────────────────────────────────────────
// Streaming scenarios
// ────────────────────────────────────────────────────────────────

#[test]
fn test_scenario_plain_text() {
    let mut t = StreamTranslator::new("msg_1", "claude-sonnet-4", Vec::new());
    let events = run(
        &mut t,
        &[
            chunk(json!({"content": "Hello, "}), None),
            chunk(json!({"content": "world!"}), None),
            chunk(json!({}), Some("stop")),
        ],
    );

    let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
    assert_eq!(
        names,
        [
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );
    assert_eq!(text_of(&events), "Hello, world!");
    assert_eq!(stop_reason(&events).as_deref(), Some("end_turn"));
    assert_well_formed(&events);
}

#[test]
fn test_scenario_native_tool_call() {
    let mut t = StreamTranslator::new("msg_2", "claude-sonnet-4", Vec::new());
    let events = run(
        &mut t,
        &[
            chunk(
                json!({"tool_calls": [{"index": 0, "id": "tool_123", "type": "function",
                    "function": {"name": "get_weather", "arguments": ""}}]}),
                None,
            ),
            chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"location\": \"S"}}]}), None),
            chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "an Francisco\"}"}}]}), None),
            chunk(json!({}), Some("tool_calls")),
        ],
    );

    assert_eq!(
        tool_inputs(&events),
        [("get_weather".to_string(), json!({"location": "San Francisco"}))]
    );
    assert_eq!(stop_reason(&events).as_deref(), Some("tool_use"));
    assert_well_formed(&events);
}

#[test]
fn test_scenario_double_encoded_arguments() {
    let mut t = StreamTranslator::new("msg_3", "claude-sonnet-4", Vec::new());
    let mut events = t.start();
    events.extend(t.process_chunk(&chunk(
        json!({"tool_calls": [{"index": 0, "id": "call_9", "function": {"name": "search", "arguments": ""}}]}),
        None,
    )));
    events.extend(t.process_chunk(&chunk(
        json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"{\\\"query\\\": "}}]}),
        None,
    )));
    events.extend(t.process_chunk(&chunk(
        json!({"tool_calls": [{"index": 0, "function": {"arguments": "\\\"\\\"}\""}}]}),
        None,
    )));
    assert!(events
        .iter()
        .all(|e| !matches!(e, StreamEvent::ContentBlockDelta { delta: Delta::InputJsonDelta { .. }, .. })));

    let closing = t.finalize();
    let deltas: Vec<&str> = closing
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: Delta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, ["{\"query\":\"\"}"]);

    events.extend(closing);
    assert_well_formed(&events);
}

#[test]
fn test_scenario_thinking_signature() {
    let mut t = StreamTranslator::new("msg_4", "claude-sonnet-4", Vec::new());
    let events = run(
        &mut t,
        &[
            chunk(json!({"reasoning_content": "Step 1:"}), None),
            chunk(json!({"reasoning_content": " Analyze."}), None),
            chunk(json!({}), Some("stop")),
        ],
    );

    let thinking: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: Delta::ThinkingDelta { thinking },
                ..
            } => Some(thinking.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(thinking, ["Step 1:", " Analyze."]);

    let signature = events.iter().find_map(|e| match e {
        StreamEvent::ContentBlockDelta {
            delta: Delta::SignatureDelta { signature },
            ..
        } => Some(signature.clone()),
        _ => None,
    });
    assert_eq!(signature, Some(thinking_signature("Step 1: Analyze.")));
    assert_eq!(stop_reason(&events).as_deref(), Some("end_turn"));
    assert_well_formed(&events);
}

#[test]
fn test_mixed_stream_is_well_formed() {
    let mut t = StreamTranslator::new("msg_5", "claude-sonnet-4", weather_tools());
    let events = run(
        &mut t,
        &[
            chunk(json!({"reasoning_content": "User wants weather."}), None),
            chunk(json!({"content": "Checking <tool_"}), None),
            chunk(
                json!({"content": "call>\n<function=get_weather>\n<parameter=city>\nOslo\n</parameter>\n<parameter=days>\n3\n</parameter>\n</function>\n</tool_call> then"}),
                None,
            ),
            chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_a", "function": {"name": "get_weather", "arguments": "{\"city\":\"Rome\",\"days\":\"2\"}"}}]}),
                None,
            ),
            chunk(json!({"content": " done."}), Some("stop")),
        ],
    );

    assert_well_formed(&events);
    assert_eq!(
        tool_inputs(&events),
        [
            ("get_weather".to_string(), json!({"city": "Oslo", "days": 3})),
            ("get_weather".to_string(), json!({"city": "Rome", "days": 2})),
        ]
    );
    let text = text_of(&events);
    assert!(text.starts_with("Checking "));
    assert!(!text.contains("<tool_call>"));
    assert!(!text.contains("<tool_"));
    assert_eq!(stop_reason(&events).as_deref(), Some("tool_use"));
}

// ────────────────────────────────────────────────────────────────
// Grammar streaming output replayed through the translator
// ────────────────────────────────────────────────────────────────

fn replay<F>(text: &str, piece: usize, mut parse: F) -> Vec<StreamEvent>
where
    F: FnMut(&str, &str) -> Option<ChunkDelta>,
{
    let mut translator = StreamTranslator::new("msg_r", "claude-sonnet-4", weather_tools());
    let mut events = translator.start();
    let mut previous = String::new();
    let chars: Vec<char> = text.chars().collect();

    for piece in chars.chunks(piece) {
        let mut current = previous.clone();
        current.extend(piece);
        if let Some(delta) = parse(&previous, &current) {
            // Text precedes the tool call it introduces.
            if let Some(content) = delta.content {
                events.extend(translator.process_chunk(&delta_chunk(ChunkDelta {
                    content: Some(content),
                    ..Default::default()
                })));
            }
            if let Some(calls) = delta.tool_calls {
                events.extend(translator.process_chunk(&delta_chunk(ChunkDelta {
                    tool_calls: Some(calls),
                    ..Default::default()
                })));
            }
        }
        previous = current;
    }
    events.extend(translator.finalize());
    events
}

#[test]
fn test_kimi_stream_replay_yields_valid_tool_input() {
    let text = "Let me check.<|tool_calls_section_begin|><|tool_call_begin|>functions.get_weather:0<|tool_call_argument_begin|>{\"city\": \"Paris\", \"days\": 2}<|tool_call_end|><|tool_calls_section_end|>";
    for piece in [1, 4, 9, 500] {
        let mut parser = KimiK2StreamParser::new();
        let events = replay(text, piece, |p, c| parser.extract_streaming(p, c));
        assert_well_formed(&events);
        assert_eq!(text_of(&events), "Let me check.", "piece size {piece}");
        assert_eq!(
            tool_inputs(&events),
            [("get_weather".to_string(), json!({"city": "Paris", "days": 2}))],
            "piece size {piece}"
        );
    }
}

#[test]
fn test_qwen_stream_replay_yields_valid_tool_input() {
    let text = "On it.\n<tool_call>\n<function=get_weather>\n<parameter=city>\nSan Francisco\n</parameter>\n<parameter=days>\n5\n</parameter>\n</function>\n</tool_call>";
    for piece in [1, 3, 11, 500] {
        let mut parser = Qwen3CoderStreamParser::new();
        let events = replay(text, piece, |p, c| parser.extract_streaming(p, c));
        assert_well_formed(&events);
        // Values stream as strings; coercion at block close restores the integer.
        assert_eq!(
            tool_inputs(&events),
            [("get_weather".to_string(), json!({"city": "San Francisco", "days": 5}))],
            "piece size {piece}"
        );
    }
}

// ────────────────────────────────────────────────────────────────
// SSE byte stream
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sse_byte_stream_translation() {
    let body = concat!(
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"id\":\"c\",\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3,\"total_tokens\":15}}\n\n",
        "data: [DONE]\n\n",
    );
    // Deliver the body in awkward 7-byte slices.
    let slices: Vec<Result<bytes::Bytes, std::io::Error>> = body
        .as_bytes()
        .chunks(7)
        .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
        .collect();

    let translator = StreamTranslator::new("msg_sse", "claude-sonnet-4", Vec::new());
    let sse: Vec<_> = translate_sse_stream(futures::stream::iter(slices), translator, None)
        .map(|r| r.unwrap())
        .collect()
        .await;

    let events: Vec<StreamEvent> = sse
        .iter()
        .map(|e| {
            let event: StreamEvent = serde_json::from_str(&e.data).unwrap();
            assert_eq!(event.event_name(), e.event);
            event
        })
        .collect();

    assert_well_formed(&events);
    assert_eq!(text_of(&events), "Hi there");
    let usage = events.iter().find_map(|e| match e {
        StreamEvent::MessageDelta { usage, .. } => Some(usage.clone()),
        _ => None,
    });
    assert_eq!(usage.map(|u| (u.input_tokens, u.output_tokens)), Some((Some(12), 3)));
}

// ────────────────────────────────────────────────────────────────
// Router
// ────────────────────────────────────────────────────────────────

fn request(model: &str, text: String, thinking: bool) -> MessagesRequest {
    let mut v = json!({
        "model": model,
        "max_tokens": 512,
        "messages": [{"role": "user", "content": text}]
    });
    if thinking {
        v["thinking"] = json!({"type": "enabled", "budget_tokens": 1024});
    }
    serde_json::from_value(v).unwrap()
}

#[test]
fn test_thinking_request_falls_back_to_capacity_scan() {
    let config: ProxyConfig = toml::from_str(
        r#"
        [routing]
        default_provider = "fast"

        [[providers]]
        key = "fast"
        name = "groq"
        api_key = "k"
        supports_reasoning = true
        max_context = 8000
        default_model = "small-reasoner"

        [[providers]]
        key = "other"
        name = "openai"
        api_key = "k"
        [providers.default_models]
        "claude-haiku" = "gpt-mini"

        [[providers]]
        key = "wide"
        name = "together"
        api_key = "k"
        max_context = 1000000
        [providers.default_models]
        "claude-opus-4" = "qwen3-coder-480b"
    "#,
    )
    .unwrap();
    config.validate().unwrap();
    let router = ProviderRouter::new(Arc::new(config));

    let req = request("claude-opus-4", "word ".repeat(20_000), true);
    assert!(estimate_context_length(&req) > 8000);

    let route = router.resolve(&req).unwrap();
    assert_eq!(route.provider_key, "wide");
    assert_eq!(route.target_model, "qwen3-coder-480b");

    // Same request, same answer.
    assert_eq!(router.route_request(&req), router.route_request(&req));

    let small = request("claude-opus-4", "hi".to_string(), true);
    assert_eq!(router.route_request(&small).as_deref(), Some("fast"));
}

#[test]
fn test_context_estimate_is_monotonic() {
    let mut previous = 0;
    for len in [0, 1, 3, 4, 5, 100, 1000, 4001] {
        let estimate = estimate_context_length(&request("m", "y".repeat(len), false));
        assert!(estimate >= previous);
        previous = estimate;
    }
    assert_eq!(previous, 1000);
}

// ────────────────────────────────────────────────────────────────
// Full server round trip against a mock upstream
// ────────────────────────────────────────────────────────────────

async fn mock_chat_completions(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some("Bearer test-key") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "bad key", "type": "invalid_api_key"}})),
        )
            .into_response();
    }

    let model = body["model"].as_str().unwrap_or_default().to_string();
    if model == "rate-limited" {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "slow down", "type": "rate_limit_exceeded"}})),
        )
            .into_response();
    }

    if body["stream"] == json!(true) {
        let frames = [
            json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"reasoning_content": "Plan."}}]}),
            json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"content": format!("model={model}")}}]}),
            json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_x", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":"}}
            ]}}]}),
            json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Lima\",\"days\":\"4\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
            json!({"id": "chatcmpl-s", "choices": [], "usage": {"prompt_tokens": 20, "completion_tokens": 9, "total_tokens": 29}}),
        ];
        let mut sse: String = frames.iter().map(|f| format!("data: {f}\n\n")).collect();
        sse.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    Json(json!({
        "id": "chatcmpl-roundtrip",
        "object": "chat.completion",
        "created": 0,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("model={model}")},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}
    }))
    .into_response()
}

async fn spawn(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_full_server_roundtrip() {
    let upstream = spawn(Router::new().route("/v1/chat/completions", post(mock_chat_completions))).await;

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("requests.jsonl");
    let config: ProxyConfig = toml::from_str(&format!(
        r#"
        [routing]
        default_provider = "mock"
        [routing.model_providers]
        "claude-limited" = "limited"

        [[providers]]
        key = "mock"
        name = "custom"
        base_url = "http://{upstream}/v1"
        api_key = "test-key"
        max_context = 1000
        [providers.default_models]
        "claude-sonnet-4" = "mock-model"

        [[providers]]
        key = "limited"
        name = "custom"
        base_url = "http://{upstream}/v1"
        api_key = "test-key"
        max_context = 1000
        default_model = "rate-limited"
    "#
    ))
    .unwrap();
    config.validate().unwrap();

    let logger = SharedLogger::new(&log_path, false).unwrap();
    let state = Arc::new(AppState::new(config, logger).unwrap());
    let addr = spawn(build_router(state)).await;
    let client = reqwest::Client::new();

    // Health
    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    // Models
    let models: Value = client
        .get(format!("http://{addr}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, ["claude-limited", "claude-sonnet-4"]);

    // Token estimate
    let count: Value = client
        .post(format!("http://{addr}/v1/messages/count_tokens"))
        .json(&json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "12345678"}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(count["input_tokens"], 2);

    // Non-streaming: the upstream sees the mapped model, the client sees its own
    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "ping"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["model"], "claude-sonnet-4");
    assert_eq!(body["id"], "msg_roundtrip");
    assert_eq!(body["content"][0]["text"], "model=mock-model");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 7);

    // Streaming
    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "stream": true,
            "tools": [{
                "name": "get_weather",
                "input_schema": {"type": "object", "properties": {"days": {"type": "integer"}}}
            }],
            "messages": [{"role": "user", "content": "weather?"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    let events: Vec<StreamEvent> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_well_formed(&events);
    assert_eq!(text_of(&events), "model=mock-model");
    assert_eq!(
        tool_inputs(&events),
        [("get_weather".to_string(), json!({"city": "Lima", "days": 4}))]
    );
    assert_eq!(stop_reason(&events).as_deref(), Some("tool_use"));

    // Upstream error status is mirrored
    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({"model": "claude-limited", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "rate_limit_error");

    // No route: every provider is too small
    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({"model": "claude-sonnet-4", "messages": [{"role": "user", "content": "z".repeat(8000)}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Routed, but no model mapping on the default provider
    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({"model": "claude-unknown", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Malformed body
    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.lines().count() >= 6);
    assert!(log.lines().all(|l| serde_json::from_str::<Value>(l).is_ok()));
}
