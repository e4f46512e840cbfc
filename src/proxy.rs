use crate::config::{ProviderConfig, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::logging::RequestLog;
use crate::router::Route;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::openai_types::{ChatCompletionChunk, ChatCompletionResponse, ChatErrorResponse};
use crate::translate::request::build_upstream_request;
use crate::translate::response::{error_type_for_status, openai_error_to_anthropic, openai_to_anthropic};
use crate::translate::streaming::StreamTranslator;

use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of proxying a non-streaming request
pub enum ProxyResult {
    Success(MessagesResponse),
    Error(ErrorResponse, u16),
}

/// Outcome of opening a streaming request: either a live event stream or an
/// upstream error that arrived before any event was produced.
pub enum StreamOutcome {
    Events(SseStream),
    Error(ErrorResponse, u16),
}

pub type SseStream = Pin<Box<dyn Stream<Item = std::result::Result<SseEvent, Infallible>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn from_stream_event(event: &StreamEvent) -> Option<Self> {
        match serde_json::to_string(event) {
            Ok(data) => Some(Self {
                event: event.event_name().to_string(),
                data,
            }),
            Err(e) => {
                error!(error = %e, event = event.event_name(), "Failed to serialize stream event");
                None
            }
        }
    }
}

/// A provider's pooled HTTP client and its chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    url: String,
    /// Set when the API key could not be resolved at startup.
    key_error: Option<String>,
}

impl Upstream {
    fn build(provider: &ProviderConfig) -> Result<Self> {
        let base_url = provider.effective_base_url()?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key_error = match provider.resolve_api_key() {
            Ok(Some(key)) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                    ProxyError::config(format!("API key for provider '{}' is not a valid header value", provider.key))
                })?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(provider = %provider.key, error = %e, "API key unavailable, requests to this provider will fail");
                Some(e.to_string())
            }
        };

        for (name, value) in &provider.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ProxyError::config(format!("Invalid header name '{name}' for provider '{}'", provider.key))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                ProxyError::config(format!("Invalid value for header '{name}' on provider '{}'", provider.key))
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(provider.timeout))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            url,
            key_error,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn ensure_ready(&self) -> Result<()> {
        match &self.key_error {
            Some(msg) => Err(ProxyError::config(msg.clone())),
            None => Ok(()),
        }
    }
}

/// One client per configured provider, built before the listener starts.
#[derive(Debug, Clone, Default)]
pub struct UpstreamPool {
    upstreams: HashMap<String, Upstream>,
}

impl UpstreamPool {
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let mut upstreams = HashMap::with_capacity(config.providers.len());
        for provider in &config.providers {
            let upstream = Upstream::build(provider)?;
            info!(provider = %provider.key, url = %upstream.url, timeout = provider.timeout, "Initialized upstream client");
            upstreams.insert(provider.key.clone(), upstream);
        }
        Ok(Self { upstreams })
    }

    pub fn get(&self, provider_key: &str) -> Result<&Upstream> {
        self.upstreams
            .get(provider_key)
            .ok_or_else(|| ProxyError::config(format!("No upstream client for provider '{provider_key}'")))
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}

async fn send_upstream(
    req: &MessagesRequest,
    route: &Route,
    provider: &ProviderConfig,
    upstream: &Upstream,
    log: &RequestLog,
) -> Result<reqwest::Response> {
    upstream.ensure_ready()?;

    let payload = build_upstream_request(req, &route.target_model, provider).into_payload()?;
    log.translated(&upstream.url, &payload);

    info!(
        request_id = log.request_id(),
        provider = %route.provider_key,
        model = %route.target_model,
        stream = req.is_streaming(),
        "POST {}",
        upstream.url
    );

    let response = upstream
        .client
        .post(&upstream.url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| ProxyError::provider(format!("Request to '{}' failed: {e}", route.provider_key)))?;

    Ok(response)
}

/// Turn an upstream error body into an Anthropic error, keeping the status.
fn upstream_error(status: u16, body: &str) -> ErrorResponse {
    match serde_json::from_str::<ChatErrorResponse>(body) {
        Ok(err) => openai_error_to_anthropic(&err),
        Err(_) => ErrorResponse::new(
            error_type_for_status(status),
            format!("Provider returned status {status}: {}", truncate(body, 500)),
        ),
    }
}

/// Forward a non-streaming request to the routed provider.
pub async fn proxy_non_streaming(
    req: &MessagesRequest,
    route: &Route,
    provider: &ProviderConfig,
    upstream: &Upstream,
    log: &RequestLog,
) -> Result<ProxyResult> {
    let response = send_upstream(req, route, provider, upstream, log).await?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::provider(format!("Failed to read response body: {e}")))?;

    debug!(request_id = log.request_id(), status, body_len = body.len(), "Upstream response");

    if status >= 400 {
        warn!(request_id = log.request_id(), status, body = %truncate(&body, 300), "Provider error");
        log.error("proxy", status, truncate(&body, 500));
        return Ok(ProxyResult::Error(upstream_error(status, &body), status));
    }

    let openai_resp: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
        ProxyError::translation(format!(
            "Failed to parse provider response: {e}. Body: {}",
            truncate(&body, 300)
        ))
    })?;

    let anthropic_resp = openai_to_anthropic(&openai_resp, req);

    let response_json = serde_json::to_value(&anthropic_resp).ok();
    log.completed(
        status,
        anthropic_resp.usage.input_tokens,
        anthropic_resp.usage.output_tokens,
        response_json.as_ref(),
    );

    Ok(ProxyResult::Success(anthropic_resp))
}

/// Forward a streaming request, returning the translated Anthropic event stream.
pub async fn proxy_streaming(
    req: &MessagesRequest,
    route: &Route,
    provider: &ProviderConfig,
    upstream: &Upstream,
    log: &RequestLog,
) -> Result<StreamOutcome> {
    let response = send_upstream(req, route, provider, upstream, log).await?;
    let status = response.status().as_u16();

    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        warn!(request_id = log.request_id(), status, body = %truncate(&body, 300), "Streaming provider error");
        log.error("proxy", status, truncate(&body, 500));
        return Ok(StreamOutcome::Error(upstream_error(status, &body), status));
    }

    let msg_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let translator = StreamTranslator::for_request(req, msg_id);

    Ok(StreamOutcome::Events(Box::pin(translate_sse_stream(
        response.bytes_stream(),
        translator,
        Some(log.clone()),
    ))))
}

/// Parse an `OpenAI` SSE byte stream and translate it into Anthropic SSE events.
///
/// Malformed frames and chunks are skipped. A transport error ends the
/// stream early, but the outbound side is still closed with the usual
/// `message_delta` + `message_stop`. Dropping the returned stream drops the
/// upstream body with it.
pub fn translate_sse_stream<S, B, E>(
    byte_stream: S,
    mut translator: StreamTranslator,
    log: Option<RequestLog>,
) -> impl Stream<Item = std::result::Result<SseEvent, Infallible>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let events = byte_stream.eventsource();
        tokio::pin!(events);

        for event in translator.start() {
            if let Some(sse) = SseEvent::from_stream_event(&event) {
                yield Ok(sse);
            }
        }

        while let Some(item) = events.next().await {
            let frame = match item {
                Ok(frame) => frame,
                Err(EventStreamError::Transport(e)) => {
                    error!(msg_id = translator.message_id(), error = %e, "Upstream stream error");
                    if let Some(ref log) = log {
                        log.error("stream", 502, format!("Upstream stream error: {e}"));
                    }
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Skipping malformed SSE frame");
                    continue;
                }
            };

            let data = frame.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, data = %truncate(data, 200), "Skipping unparseable chunk");
                    if let Some(ref log) = log {
                        log.warn(
                            "stream",
                            "Skipped unparseable chunk",
                            serde_json::json!({"error": e.to_string(), "data": truncate(data, 200)}),
                        );
                    }
                    continue;
                }
            };

            for event in translator.process_chunk(&chunk) {
                if let Some(sse) = SseEvent::from_stream_event(&event) {
                    yield Ok(sse);
                }
            }
        }

        for event in translator.finalize() {
            if let Some(sse) = SseEvent::from_stream_event(&event) {
                yield Ok(sse);
            }
        }

        let usage = translator.usage();
        if let Some(ref log) = log {
            log.completed(200, usage.input_tokens, usage.output_tokens, None);
        }
        debug!(msg_id = translator.message_id(), "Stream completed");
    }
}

/// Longest prefix of `s` of at most `max` bytes that ends on a char boundary.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::Value;

    fn collect(frames: Vec<&'static str>) -> Vec<SseEvent> {
        let bytes = futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<_, std::io::Error>(Bytes::from_static(f.as_bytes()))),
        );
        let translator = StreamTranslator::new("msg_test", "claude-sonnet-4", Vec::new());
        let stream = translate_sse_stream(bytes, translator, None);
        tokio_test::block_on(stream.map(|r| r.unwrap()).collect::<Vec<_>>())
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "h");
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let events = collect(vec![
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel",
            "lo\"}}]}\n\n",
            ": keep-alive comment\n\n",
            "data: not json\n\n",
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);

        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let delta: Value = serde_json::from_str(&events[2].data).unwrap();
        assert_eq!(delta["delta"]["text"], "Hello");
        let message_delta: Value = serde_json::from_str(&events[4].data).unwrap();
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn test_missing_done_still_closes_stream() {
        let events = collect(vec![
            "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial\"}}]}\n\n",
        ]);
        assert_eq!(events.first().map(|e| e.event.as_str()), Some("message_start"));
        assert_eq!(events.last().map(|e| e.event.as_str()), Some("message_stop"));
    }

    #[test]
    fn test_skipped_chunk_lands_in_request_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.jsonl");
        let log = crate::logging::SharedLogger::new(&path, false).unwrap().request("req-s");

        let bytes = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"data: not json\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);
        let translator = StreamTranslator::new("msg_test", "m", Vec::new());
        let events: Vec<SseEvent> = tokio_test::block_on(
            translate_sse_stream(bytes, translator, Some(log))
                .map(|r| r.unwrap())
                .collect(),
        );
        assert_eq!(events.last().map(|e| e.event.as_str()), Some("message_stop"));

        let lines: Vec<Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let skipped = lines.iter().find(|l| l["level"] == "warn").unwrap();
        assert_eq!(skipped["component"], "stream");
        assert_eq!(skipped["request_id"], "req-s");
        assert_eq!(skipped["context"]["data"], "not json");
    }

    #[test]
    fn test_transport_error_ends_stream_gracefully() {
        let bytes = futures::stream::iter(vec![
            Ok(Bytes::from_static(
                b"data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n\n",
            )),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(
                b"data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"never\"}}]}\n\n",
            )),
        ]);
        let translator = StreamTranslator::new("msg_test", "m", Vec::new());
        let events: Vec<SseEvent> = tokio_test::block_on(
            translate_sse_stream(bytes, translator, None)
                .map(|r| r.unwrap())
                .collect(),
        );
        assert!(events.iter().all(|e| !e.data.contains("never")));
        assert_eq!(events.last().map(|e| e.event.as_str()), Some("message_stop"));
    }

    #[test]
    fn test_upstream_error_mapping() {
        let err = upstream_error(429, r#"{"error":{"message":"slow","type":"rate_limit_exceeded"}}"#);
        assert_eq!(err.error.error_type, "rate_limit_error");
        let err = upstream_error(503, "<html>down</html>");
        assert_eq!(err.error.error_type, "overloaded_error");
        assert!(err.error.message.contains("503"));
    }

    #[test]
    fn test_pool_reports_missing_key_per_provider() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [routing]
            default_provider = "a"

            [[providers]]
            key = "a"
            name = "custom"
            base_url = "http://127.0.0.1:9/v1/"
            api_key = "secret"
            [providers.extra_headers]
            "X-Title" = "claude-bridge"

            [[providers]]
            key = "b"
            name = "custom"
            base_url = "http://127.0.0.1:9/v1"
            api_key_env = "CLAUDE_BRIDGE_TEST_UNSET_KEY"
        "#,
        )
        .unwrap();

        let pool = UpstreamPool::from_config(&config).unwrap();
        assert_eq!(pool.len(), 2);
        let a = pool.get("a").unwrap();
        assert_eq!(a.url(), "http://127.0.0.1:9/v1/chat/completions");
        assert!(a.ensure_ready().is_ok());
        assert!(matches!(pool.get("b").unwrap().ensure_ready(), Err(ProxyError::Config { .. })));
        assert!(pool.get("zzz").is_err());
    }
}
