use crate::error::{ProxyError, Result};
use crate::providers::ProviderPreset;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub routing: RoutingConfig,
    /// Declaration order is significant: it breaks ties during routing.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
    /// Include request/response bodies in the request log.
    #[serde(default)]
    pub log_bodies: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub default_provider: String,
    /// Inbound model name -> provider key.
    #[serde(default)]
    pub model_providers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Inbound model name -> upstream model name.
    #[serde(default)]
    pub default_models: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub supports_reasoning: bool,
    #[serde(default)]
    pub reasoning_config: ReasoningConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_override: Option<u64>,
    /// Approximate context window in tokens; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context: Option<u64>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Body field that receives `thinking.budget_tokens`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget_param: Option<String>,
    #[serde(default)]
    pub include_reasoning: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            log_bodies: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8083
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("claude-bridge.log")
}

fn default_timeout() -> u64 {
    600
}

impl ProxyConfig {
    /// Load and validate config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(ProxyError::config(format!(
            "No config file found. Searched: {}. Create one from config.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Reject configurations the router could never serve correctly.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(ProxyError::config("At least one [[providers]] entry is required"));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.key.as_str()) {
                return Err(ProxyError::config(format!(
                    "Duplicate provider key '{}'",
                    provider.key
                )));
            }
            provider.effective_base_url()?;
        }

        if self.provider(&self.routing.default_provider).is_none() {
            return Err(ProxyError::config(format!(
                "routing.default_provider '{}' does not name a configured provider",
                self.routing.default_provider
            )));
        }

        for (model, key) in &self.routing.model_providers {
            if self.provider(key).is_none() {
                return Err(ProxyError::config(format!(
                    "routing.model_providers maps '{model}' to unknown provider '{key}'"
                )));
            }
        }

        Ok(())
    }

    pub fn provider(&self, key: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.key == key)
    }

    /// Every inbound model name mentioned anywhere in the routing tables.
    pub fn known_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .routing
            .model_providers
            .keys()
            .chain(self.providers.iter().flat_map(|p| p.default_models.keys()))
            .cloned()
            .collect();
        models.sort();
        models.dedup();
        models
    }
}

impl ProviderConfig {
    /// Resolve the effective base URL (config override or provider preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.base_url {
            return Ok(url.clone());
        }

        let preset = ProviderPreset::from_name(&self.name).ok_or_else(|| {
            ProxyError::config(format!(
                "Provider '{}' has no base_url and '{}' is not a known preset. Known providers: {}",
                self.key,
                self.name,
                ProviderPreset::all()
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        Ok(preset.base_url.to_string())
    }

    /// Resolve the API key: inline value, then the configured (or preset)
    /// environment variable. `None` means the upstream needs no auth header.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        if let Some(ref key) = self.api_key {
            return Ok(Some(key.clone()));
        }

        if let Some(ref env) = self.api_key_env {
            return std::env::var(env).map(Some).map_err(|_| {
                ProxyError::config(format!(
                    "Environment variable '{}' not set. Set it with the API key for provider '{}'.",
                    env, self.key
                ))
            });
        }

        Ok(ProviderPreset::from_name(&self.name)
            .and_then(|preset| std::env::var(preset.default_api_key_env).ok()))
    }

    /// Whether this provider can serve `model` without relying on routing tables.
    pub fn declares_model(&self, model: &str) -> bool {
        self.default_models.contains_key(model) || self.default_model.is_some()
    }

    /// Whether the approximate context window fits `required_tokens`.
    pub fn has_context_for(&self, required_tokens: u64) -> bool {
        self.max_context.map_or(true, |max| max >= required_tokens)
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("claude-bridge.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("claude-bridge")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("claude-bridge").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("claude-bridge").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".claude-bridge.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// Printable search order, used by `--show-config-paths`.
pub fn describe_search_paths() -> Vec<String> {
    config_search_paths()
        .iter()
        .map(|p| p.display().to_string())
        .collect()
}
