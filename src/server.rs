use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{RequestLog, SharedLogger};
use crate::proxy::{self, ProxyResult, StreamOutcome, UpstreamPool};
use crate::router::{estimate_context_length, ProviderRouter};
use crate::translate::anthropic_types::{CountTokensResponse, ErrorResponse, MessagesRequest};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Everything a request handler needs, built once before serving.
#[derive(Clone)]
pub struct AppState {
    pub router: ProviderRouter,
    pub upstreams: UpstreamPool,
    pub logger: SharedLogger,
}

impl AppState {
    pub fn new(config: ProxyConfig, logger: SharedLogger) -> Result<Self> {
        let upstreams = UpstreamPool::from_config(&config)?;
        Ok(Self {
            router: ProviderRouter::new(Arc::new(config)),
            upstreams,
            logger,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP status and Anthropic error body for a proxy failure.
fn error_response(err: &ProxyError) -> (StatusCode, ErrorResponse) {
    match err {
        ProxyError::Routing { .. } => (StatusCode::NOT_FOUND, ErrorResponse::not_found(err.to_string())),
        ProxyError::ModelMapping { .. } => {
            (StatusCode::BAD_REQUEST, ErrorResponse::invalid_request(err.to_string()))
        }
        _ if err.is_preflight() => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::api_error(err.to_string()),
        ),
        _ => (
            StatusCode::BAD_GATEWAY,
            ErrorResponse::api_error(format!("Proxy error: {err}")),
        ),
    }
}

fn fail(log: &RequestLog, component: &str, err: &ProxyError) -> Response {
    let (status, body) = error_response(err);
    tracing::error!(request_id = log.request_id(), error = %err, preflight = err.is_preflight(), "Request failed");
    log.error(component, status.as_u16(), err.to_string());
    (status, Json(body)).into_response()
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let log = state.logger.request(uuid::Uuid::new_v4().to_string());

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return bad_request(&log, format!("Invalid request body: {e}")),
    };
    let req: MessagesRequest = match serde_json::from_value(raw.clone()) {
        Ok(r) => r,
        Err(e) => return bad_request(&log, format!("Invalid request body: {e}")),
    };

    log.received(&req.model, req.is_streaming(), req.messages.len(), &raw);

    let route = match state.router.resolve(&req) {
        Ok(r) => r,
        Err(e) => return fail(&log, "router", &e),
    };
    log.routed(&route.provider_key, &route.target_model, estimate_context_length(&req));

    let (Some(provider), Ok(upstream)) = (
        state.router.provider(&route.provider_key),
        state.upstreams.get(&route.provider_key),
    ) else {
        let err = ProxyError::config(format!("Provider '{}' is not initialized", route.provider_key));
        return fail(&log, "server", &err);
    };

    if req.is_streaming() {
        match proxy::proxy_streaming(&req, &route, provider, upstream, &log).await {
            Ok(StreamOutcome::Events(events)) => {
                let events = events.map(|item| {
                    item.map(|sse| Event::default().event(sse.event).data(sse.data))
                });
                Sse::new(events).keep_alive(KeepAlive::default()).into_response()
            }
            Ok(StreamOutcome::Error(err, status)) => upstream_status(err, status),
            Err(e) => fail(&log, "proxy", &e),
        }
    } else {
        match proxy::proxy_non_streaming(&req, &route, provider, upstream, &log).await {
            Ok(ProxyResult::Success(resp)) => Json(resp).into_response(),
            Ok(ProxyResult::Error(err, status)) => upstream_status(err, status),
            Err(e) => fail(&log, "proxy", &e),
        }
    }
}

fn bad_request(log: &RequestLog, message: String) -> Response {
    tracing::warn!(request_id = log.request_id(), %message, "Rejected request");
    log.error("server", 400, message.clone());
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::invalid_request(message))).into_response()
}

fn upstream_status(err: ErrorResponse, status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(err)).into_response()
}

async fn handle_count_tokens(body: Bytes) -> Response {
    match serde_json::from_slice::<MessagesRequest>(&body) {
        Ok(req) => Json(CountTokensResponse {
            input_tokens: estimate_context_length(&req),
        })
        .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::invalid_request(format!("Invalid request body: {e}"))),
        )
            .into_response(),
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.router.config();
    let models: Vec<serde_json::Value> = config
        .known_models()
        .into_iter()
        .map(|id| {
            let owner = config
                .routing
                .model_providers
                .get(&id)
                .cloned()
                .unwrap_or_else(|| config.routing.default_provider.clone());
            serde_json::json!({
                "id": id,
                "type": "model",
                "object": "model",
                "owned_by": owner,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
