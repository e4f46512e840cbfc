//! JSONL request log.
//!
//! Diagnostics go through `tracing`; this sink keeps one line per request
//! lifecycle step so a whole exchange can be reconstructed by `request_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            request_id: None,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_context(mut self, ctx: Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// Append-only JSONL writer.
pub struct Logger {
    writer: BufWriter<File>,
    log_bodies: bool,
}

impl Logger {
    pub fn new(file_path: impl AsRef<Path>, log_bodies: bool) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            log_bodies,
        })
    }

    pub fn log(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(line) => {
                if let Err(e) = writeln!(self.writer, "{line}").and_then(|()| self.writer.flush()) {
                    tracing::warn!(error = %e, "Failed to write request log entry");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize request log entry"),
        }
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>, log_bodies: bool) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::new(file_path, log_bodies)?))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.0.lock() {
            logger.log(&entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn log_bodies(&self) -> bool {
        self.0.lock().map(|l| l.log_bodies).unwrap_or(false)
    }

    /// Start a per-request handle that stamps every entry with `request_id`.
    pub fn request(&self, request_id: impl Into<String>) -> RequestLog {
        RequestLog {
            logger: self.clone(),
            request_id: request_id.into(),
            log_bodies: self.log_bodies(),
        }
    }
}

/// Lifecycle logging for one proxied request.
#[derive(Clone)]
pub struct RequestLog {
    logger: SharedLogger,
    request_id: String,
    log_bodies: bool,
}

impl RequestLog {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn entry(&self, level: LogLevel, component: &str, message: impl Into<String>, ctx: Value) {
        self.logger.log(
            LogEntry::new(level, component, message)
                .with_request_id(self.request_id.clone())
                .with_context(ctx),
        );
    }

    pub fn received(&self, model: &str, streaming: bool, messages: usize, body: &Value) {
        let mut ctx = json!({"model": model, "stream": streaming, "messages": messages});
        if self.log_bodies {
            ctx["body"] = body.clone();
        }
        self.entry(LogLevel::Info, "server", "Request received", ctx);
    }

    pub fn routed(&self, provider: &str, target_model: &str, estimated_tokens: u64) {
        self.entry(
            LogLevel::Info,
            "router",
            "Request routed",
            json!({
                "provider": provider,
                "target_model": target_model,
                "estimated_tokens": estimated_tokens,
            }),
        );
    }

    pub fn translated(&self, url: &str, payload: &Value) {
        let mut ctx = json!({"url": url});
        if self.log_bodies {
            ctx["body"] = payload.clone();
        }
        self.entry(LogLevel::Debug, "proxy", "Upstream request built", ctx);
    }

    pub fn completed(&self, status: u16, input_tokens: u64, output_tokens: u64, response: Option<&Value>) {
        let mut ctx = json!({
            "status": status,
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        });
        if let Some(body) = response.filter(|_| self.log_bodies) {
            ctx["body"] = body.clone();
        }
        self.entry(LogLevel::Info, "proxy", "Request completed", ctx);
    }

    pub fn error(&self, component: &str, status: u16, message: impl Into<String>) {
        self.entry(LogLevel::Error, component, message, json!({"status": status}));
    }

    pub fn warn(&self, component: &str, message: impl Into<String>, ctx: Value) {
        self.entry(LogLevel::Warn, component, message, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_lifecycle_entries_carry_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("requests.jsonl");
        let logger = SharedLogger::new(&path, false).unwrap();

        let log = logger.request("req-1");
        log.received("claude-sonnet-4", true, 2, &json!({"secret": "body"}));
        log.routed("kimi", "kimi-k2", 42);
        log.completed(200, 10, 5, Some(&json!({"content": []})));
        log.error("proxy", 502, "upstream went away");

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l["request_id"] == "req-1"));
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[1]["context"]["target_model"], "kimi-k2");
        assert!(lines[0]["context"].get("body").is_none());
        assert!(lines[2]["context"].get("body").is_none());
        assert_eq!(lines[3]["level"], "error");
    }

    #[test]
    fn test_bodies_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bodies.jsonl");
        let logger = SharedLogger::new(&path, true).unwrap();

        let log = logger.request("req-2");
        log.received("m", false, 1, &json!({"messages": []}));
        log.translated("http://up/chat/completions", &json!({"model": "x"}));
        logger.info("startup", "plain entry");

        let lines = read_lines(&path);
        assert_eq!(lines[0]["context"]["body"]["messages"], json!([]));
        assert_eq!(lines[1]["context"]["body"]["model"], "x");
        assert!(lines[2].get("request_id").is_none());
    }
}
