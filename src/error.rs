//! Error types for the proxy.
//!
//! Only pre-flight failures (configuration, routing, model mapping, upstream
//! transport) are represented here. Problems inside a running translation
//! (a bad chunk, a malformed embedded tool call, a parameter that does not
//! match its schema) are recovered where they happen and only logged.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("No provider could be determined for model '{model}' based on routing rules")]
    Routing { model: String },

    #[error("No model mapping for '{model}' on provider '{provider}' and no default_model configured")]
    ModelMapping { model: String, provider: String },

    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn routing(model: impl Into<String>) -> Self {
        Self::Routing {
            model: model.into(),
        }
    }

    pub fn model_mapping(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::ModelMapping {
            model: model.into(),
            provider: provider.into(),
        }
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True for failures detected before any upstream call was attempted.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Routing { .. } | Self::ModelMapping { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
