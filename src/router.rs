//! Provider selection and upstream model mapping.
//!
//! Routing is a pure function of the configuration and the inbound request:
//! nothing here performs I/O, so the router is shared read-only across all
//! in-flight requests.

use crate::config::{ProviderConfig, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::translate::anthropic_types::{ContentBlock, MessageContent, MessagesRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rough token estimate: total characters of every text-bearing part of the
/// request, divided by four.
pub fn estimate_context_length(req: &MessagesRequest) -> u64 {
    let mut chars = req.system.as_ref().map_or(0, |s| s.as_text().chars().count());

    for msg in &req.messages {
        chars += match &msg.content {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
        };
    }

    (chars / 4) as u64
}

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.chars().count(),
        ContentBlock::ToolUse { input, .. } => input.to_string().chars().count(),
        ContentBlock::ToolResult { content, .. } => {
            content.as_ref().map_or(0, |c| c.as_text().chars().count())
        }
        ContentBlock::Thinking { thinking, .. } => thinking.chars().count(),
        ContentBlock::Image { .. } | ContentBlock::Unsupported => 0,
    }
}

/// Where a request goes: provider key plus the model name sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub provider_key: String,
    pub target_model: String,
}

#[derive(Debug, Clone)]
pub struct ProviderRouter {
    config: Arc<ProxyConfig>,
}

impl ProviderRouter {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn provider(&self, key: &str) -> Option<&ProviderConfig> {
        self.config.provider(key)
    }

    /// Pick the provider key for a request, or `None` when nothing qualifies.
    pub fn route_request(&self, req: &MessagesRequest) -> Option<String> {
        let model = req.model.as_str();
        let required = estimate_context_length(req);

        if req.thinking_requested() {
            match self.find_reasoning_provider(model) {
                Some(p) if p.has_context_for(required) => {
                    return Some(p.key.clone());
                }
                Some(p) => warn!(
                    model,
                    provider = %p.key,
                    required,
                    max_context = ?p.max_context,
                    "Reasoning provider lacks context capacity, falling back to standard routing"
                ),
                None => warn!(
                    model,
                    "No reasoning-capable provider found, falling back to standard routing"
                ),
            }
        }

        let routing = &self.config.routing;

        if let Some(p) = routing
            .model_providers
            .get(model)
            .and_then(|key| self.config.provider(key))
        {
            if p.has_context_for(required) {
                info!(model, provider = %p.key, "Selected provider via model mapping");
                return Some(p.key.clone());
            }
            debug!(model, provider = %p.key, required, "Mapped provider context too small");
        }

        if let Some(p) = self.config.provider(&routing.default_provider) {
            if p.has_context_for(required) {
                info!(model, provider = %p.key, "Selected default provider");
                return Some(p.key.clone());
            }
            debug!(model, provider = %p.key, required, "Default provider context too small");
        }

        // Best fit: the smallest sufficient window keeps large-context
        // providers free for requests that need them.
        let mut candidates: Vec<&ProviderConfig> = self
            .config
            .providers
            .iter()
            .filter(|p| p.declares_model(model) && p.has_context_for(required))
            .collect();
        candidates.sort_by_key(|p| p.max_context.unwrap_or(u64::MAX));

        if let Some(p) = candidates.first() {
            info!(
                model,
                provider = %p.key,
                required,
                max_context = ?p.max_context,
                "Selected provider via context-aware scan"
            );
            return Some(p.key.clone());
        }

        warn!(model, required, "No provider qualifies for request");
        None
    }

    fn find_reasoning_provider(&self, model: &str) -> Option<&ProviderConfig> {
        let routing = &self.config.routing;

        if let Some(p) = routing
            .model_providers
            .get(model)
            .and_then(|key| self.config.provider(key))
            .filter(|p| p.supports_reasoning)
        {
            info!(model, provider = %p.key, "Selected reasoning provider via model mapping");
            return Some(p);
        }

        if let Some(p) = self
            .config
            .provider(&routing.default_provider)
            .filter(|p| p.supports_reasoning)
        {
            info!(model, provider = %p.key, "Selected default provider for reasoning");
            return Some(p);
        }

        let mut reasoning = self.config.providers.iter().filter(|p| p.supports_reasoning);
        let first = reasoning.clone().next()?;
        let chosen = reasoning
            .find(|p| p.default_models.contains_key(model))
            .unwrap_or(first);
        info!(model, provider = %chosen.key, "Selected reasoning provider from scan");
        Some(chosen)
    }

    /// Upstream model name for `inbound_model` on a provider. The inbound
    /// name itself is never forwarded as a fallback.
    pub fn get_target_model(&self, inbound_model: &str, provider_key: &str) -> Result<String> {
        let provider = self
            .config
            .provider(provider_key)
            .ok_or_else(|| ProxyError::config(format!("Unknown provider '{provider_key}'")))?;

        provider
            .default_models
            .get(inbound_model)
            .or(provider.default_model.as_ref())
            .cloned()
            .ok_or_else(|| ProxyError::model_mapping(inbound_model, provider_key))
    }

    /// Route and map in one step.
    pub fn resolve(&self, req: &MessagesRequest) -> Result<Route> {
        let provider_key = self
            .route_request(req)
            .ok_or_else(|| ProxyError::routing(&req.model))?;
        let target_model = self.get_target_model(&req.model, &provider_key)?;
        Ok(Route {
            provider_key,
            target_model,
        })
    }
}
