//! edge-router
//!
//! Dynamically configured HTTP/HTTPS reverse proxy.
//!
//! This service:
//! - Syncs routes from the coordination store and keeps them fresh
//! - Accepts clear-text HTTP and TLS connections on a listener pair
//! - Dispatches by Host header or TLS SNI
//! - Proxies HTTP/1 exchanges to discovered backends, upgrades included

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_router::config::Config;
use edge_router::discovery::StoreDiscovery;
use edge_router::store::{EtcdStore, Store};
use edge_router::{HttpListener, ListenerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    info!("Starting edge router");
    info!(
        http_addr = %config.http_addr,
        https_addr = %config.https_addr,
        store_url = %config.store_url,
        route_prefix = %config.route_prefix,
        discovery_prefix = %config.discovery_prefix,
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = Arc::new(EtcdStore::new(&config.store_url));
    let discovery = Arc::new(StoreDiscovery::new(
        Arc::clone(&store),
        &config.discovery_prefix,
    ));

    let listener = HttpListener::new(
        ListenerConfig::new(config.http_addr, config.https_addr)
            .with_route_prefix(&config.route_prefix),
        store,
        discovery,
    );
    listener.start().await?;
    info!(
        http = ?listener.http_addr(),
        https = ?listener.https_addr(),
        "edge router serving"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    listener.close().await;
    Ok(())
}
