//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5001`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.
    /// Env: `DATABASE_PATH`
    /// Default: `./palaver.db`
    pub database_path: PathBuf,

    /// Base URL of the upstream identity API hosting both verification
    /// authorities.
    /// Env: `AUTH_API_URL`
    /// Default: `http://127.0.0.1:8000`
    pub auth_api_url: String,

    /// Per-authority timeout for verification calls, in seconds. A timed-out
    /// authority counts as a rejection, not a fatal error.
    /// Env: `AUTH_TIMEOUT_SECS`
    /// Default: `3`
    pub auth_timeout_secs: u64,

    /// How long a verified credential stays in the token cache, in seconds.
    /// Env: `AUTH_CACHE_TTL_SECS`
    /// Default: `300`
    pub auth_cache_ttl_secs: u64,

    /// Idle period after which presence records are purged, in seconds.
    /// Env: `PRESENCE_TTL_SECS`
    /// Default: `86400`
    pub presence_ttl_secs: u64,

    /// Comma-separated list of allowed CORS origins. Empty allows any.
    /// Env: `ALLOWED_ORIGINS`
    /// Default: empty
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 5001).into(),
            database_path: PathBuf::from("./palaver.db"),
            auth_api_url: "http://127.0.0.1:8000".to_string(),
            auth_timeout_secs: 3,
            auth_cache_ttl_secs: 300,
            presence_ttl_secs: 86_400,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("AUTH_API_URL") {
            if !url.is_empty() {
                config.auth_api_url = url;
            }
        }

        if let Ok(val) = std::env::var("AUTH_TIMEOUT_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.auth_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("AUTH_CACHE_TTL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.auth_cache_ttl_secs = n;
            }
        }

        if let Ok(val) = std::env::var("PRESENCE_TTL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.presence_ttl_secs = n;
            }
        }

        if let Ok(val) = std::env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5001).into());
        assert_eq!(config.auth_timeout_secs, 3);
        assert!(config.allowed_origins.is_empty());
    }
}
