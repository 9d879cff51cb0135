//! Router configuration (env-driven).

use std::net::SocketAddr;

use anyhow::{Context, Result};

/// Process configuration, read from `EDGE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Clear-text HTTP bind address.
    pub http_addr: SocketAddr,

    /// TLS bind address.
    pub https_addr: SocketAddr,

    /// Coordination-store base URL (example: http://127.0.0.1:4001).
    pub store_url: String,

    /// Store prefix holding durable routes.
    pub route_prefix: String,

    /// Store prefix holding service membership.
    pub discovery_prefix: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let http_addr = std::env::var("EDGE_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("EDGE_HTTP_ADDR must be a socket address")?;

        let https_addr = std::env::var("EDGE_HTTPS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8443".to_string())
            .parse()
            .context("EDGE_HTTPS_ADDR must be a socket address")?;

        let store_url = std::env::var("EDGE_STORE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:4001".to_string());

        let route_prefix = std::env::var("EDGE_ROUTE_PREFIX")
            .unwrap_or_else(|_| crate::proxy::DEFAULT_ROUTE_PREFIX.to_string());

        let discovery_prefix = std::env::var("EDGE_DISCOVERY_PREFIX")
            .unwrap_or_else(|_| "/edge-router/services".to_string());

        let log_level = std::env::var("EDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            http_addr,
            https_addr,
            store_url,
            route_prefix,
            discovery_prefix,
            log_level,
        })
    }
}
