//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_AUTH_URL, DEFAULT_CHAT_PORT, DEFAULT_OUTBOUND_QUEUE};
use parley_shared::ContentFilter;
use parley_store::Backend;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the WebSocket endpoint and HTTP API.
    /// Env: `CHAT_ADDR`
    /// Default: `0.0.0.0:8000`
    pub chat_addr: SocketAddr,

    /// Identity service endpoint used to verify login tokens.
    /// Env: `AUTH_URL`
    pub auth_url: String,

    /// Optional timeout for one verification request.
    /// Env: `AUTH_TIMEOUT_SECS`
    pub auth_timeout: Option<Duration>,

    /// `token=user,...` pairs. When set, tokens are checked against this
    /// table instead of the identity service.
    /// Env: `STATIC_TOKENS`
    pub static_tokens: Option<String>,

    /// Env: `STORAGE_BACKEND` (`json`, `sqlite` or `memory`)
    /// Default: `json`
    pub storage_backend: Backend,

    /// Where documents live.
    /// Env: `DATA_DIR`
    /// Default: the platform data directory, else `./data`.
    pub data_dir: PathBuf,

    /// Masks terms out of every chat and private message.
    /// Env: `SENSITIVE_WORDS` (comma-separated)
    pub filter: ContentFilter,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Capacity of each connection's outbound queue.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chat_addr: ([0, 0, 0, 0], DEFAULT_CHAT_PORT).into(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_timeout: None,
            static_tokens: None,
            storage_backend: Backend::Json,
            data_dir: parley_store::default_data_dir().unwrap_or_else(|_| PathBuf::from("./data")),
            filter: ContentFilter::default(),
            instance_name: "Parley".to_string(),
            admin_token: None,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("CHAT_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.chat_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid CHAT_ADDR, using default");
            }
        }

        if let Some(url) = var("AUTH_URL") {
            if !url.is_empty() {
                config.auth_url = url;
            }
        }

        if let Some(val) = var("AUTH_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.auth_timeout = Some(Duration::from_secs(secs)),
                _ => tracing::warn!(value = %val, "Invalid AUTH_TIMEOUT_SECS, no timeout"),
            }
        }

        if let Some(tokens) = var("STATIC_TOKENS") {
            if !tokens.trim().is_empty() {
                config.static_tokens = Some(tokens);
            }
        }

        if let Some(val) = var("STORAGE_BACKEND") {
            match val.parse::<Backend>() {
                Ok(backend) => config.storage_backend = backend,
                Err(e) => tracing::warn!(error = %e, "Invalid STORAGE_BACKEND, using json"),
            }
        }

        if let Some(dir) = var("DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        if let Some(words) = var("SENSITIVE_WORDS") {
            config.filter = ContentFilter::from_csv(&words);
        }

        if let Some(name) = var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = var("OUTBOUND_QUEUE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.outbound_queue = n,
                _ => tracing::warn!(value = %val, "Invalid OUTBOUND_QUEUE, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.chat_addr, ([0, 0, 0, 0], 8000).into());
        assert_eq!(config.auth_url, "http://localhost:8001/api/user/info");
        assert_eq!(config.storage_backend, Backend::Json);
        assert!(config.admin_token.is_none());
        assert_eq!(config.filter.apply("foo bar"), "foo bar");
        assert_eq!(config.outbound_queue, 256);
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("CHAT_ADDR", "127.0.0.1:9000"),
            ("AUTH_TIMEOUT_SECS", "3"),
            ("STORAGE_BACKEND", "sqlite"),
            ("DATA_DIR", "/tmp/parley"),
            ("SENSITIVE_WORDS", "foo, bar ,,"),
            ("ADMIN_TOKEN", "secret"),
            ("STATIC_TOKENS", "t1=alice"),
            ("OUTBOUND_QUEUE", "16"),
        ]);
        assert_eq!(config.chat_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.auth_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.storage_backend, Backend::Sqlite);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/parley"));
        assert_eq!(config.filter.apply("foo, bar, baz"), "***, ***, baz");
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.static_tokens.as_deref(), Some("t1=alice"));
        assert_eq!(config.outbound_queue, 16);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("CHAT_ADDR", "not-an-addr"),
            ("STORAGE_BACKEND", "redis"),
            ("OUTBOUND_QUEUE", "0"),
            ("ADMIN_TOKEN", ""),
        ]);
        assert_eq!(config.chat_addr, ([0, 0, 0, 0], 8000).into());
        assert_eq!(config.storage_backend, Backend::Json);
        assert_eq!(config.outbound_queue, 256);
        assert!(config.admin_token.is_none());
    }
}
