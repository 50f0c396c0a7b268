use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::Path};

use crate::error::{ChatError, CoreResult};

fn default_method() -> String {
    "POST".to_string()
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}
fn default_max_retry_count() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointCfg {
    /// Chat streaming endpoint, e.g. `https://host/api/chat/stream`.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Static headers sent with every turn (the bearer token is added separately).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Longest silent gap tolerated on an open stream (default 30000ms)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Connection attempts after the first one before giving up (default 3)
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Base delay for exponential backoff between attempts (default 500ms)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl EndpointCfg {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            timeout_ms: default_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_retry_count: default_max_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn http_method(&self) -> CoreResult<http::Method> {
        http::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ChatError::Validation(format!("invalid method '{}': {e}", self.method)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Debounce window for content-delta notifications (default 50ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl StreamCfg {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub endpoint: EndpointCfg,
    /// Missing in older configs → defaults.
    #[serde(default)]
    pub stream: StreamCfg,
    /// Extra fields merged into every request body.
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default = "default_true")]
    pub save_conversation: bool,
}

impl SessionConfig {
    /// Defaults for everything but the endpoint URL.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointCfg::new(url),
            stream: StreamCfg::default(),
            body: Map::new(),
            save_conversation: true,
        }
    }

    /// Load a SessionConfig from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ChatError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ChatError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ChatError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| ChatError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ChatError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| ChatError::Other(e.into())))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.endpoint.url.trim().is_empty() {
            return Err(ChatError::Validation("endpoint.url must not be empty".into()));
        }
        self.endpoint.http_method()?;
        Ok(())
    }
}
