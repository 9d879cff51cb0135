//! Listener pair, connection dispatch, and the admin API.
//!
//! Two TCP acceptors (plain HTTP and TLS) feed per-connection handler
//! tasks. Admin operations write only to the coordination store; the sync
//! loop is the sole writer of the in-memory table, so state converges to
//! store order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, Instrument};

use super::engine;
use super::sni::{peek_client_hello, ReplayStream};
use super::table::{EventSink, RoutePayload, RouteTable};
use crate::discovery::Discovery;
use crate::error::RouterError;
use crate::store::Store;
use crate::sync;

/// Default store prefix the route table is synced from.
pub const DEFAULT_ROUTE_PREFIX: &str = "/edge-router/http";

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address for clear-text HTTP.
    pub http_addr: SocketAddr,
    /// Bind address for TLS.
    pub https_addr: SocketAddr,
    /// Store prefix holding the durable routes.
    pub route_prefix: String,
}

impl ListenerConfig {
    pub fn new(http_addr: SocketAddr, https_addr: SocketAddr) -> Self {
        Self {
            http_addr,
            https_addr,
            route_prefix: DEFAULT_ROUTE_PREFIX.to_string(),
        }
    }

    pub fn with_route_prefix(mut self, prefix: &str) -> Self {
        self.route_prefix = prefix.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundAddrs {
    http: SocketAddr,
    https: SocketAddr,
}

/// The edge router's frontend: listener pair plus store-driven routes.
pub struct HttpListener {
    config: ListenerConfig,
    store: Arc<dyn Store>,
    table: Arc<RouteTable>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
    bound: Mutex<Option<BoundAddrs>>,
}

impl HttpListener {
    /// Build a listener. Must be called from within a tokio runtime.
    pub fn new(
        config: ListenerConfig,
        store: Arc<dyn Store>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            table: Arc::new(RouteTable::new(discovery)),
            stop_tx,
            closed: AtomicBool::new(false),
            bound: Mutex::new(None),
        }
    }

    /// Load the route snapshot, start the watch loop, and bind both
    /// acceptors. Fails synchronously if the snapshot or either bind
    /// fails, releasing whatever was already acquired.
    pub async fn start(&self) -> Result<(), RouterError> {
        if let Err(e) = sync::start(
            Arc::clone(&self.store),
            Arc::clone(&self.table),
            self.config.route_prefix.clone(),
            self.stop_tx.subscribe(),
        )
        .await
        {
            self.table.close_bindings().await;
            return Err(e);
        }

        let http = match TcpListener::bind(self.config.http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.release_on_failed_start().await;
                return Err(RouterError::Bind(e));
            }
        };
        let https = match TcpListener::bind(self.config.https_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                drop(http);
                self.release_on_failed_start().await;
                return Err(RouterError::Bind(e));
            }
        };

        let bound = match (http.local_addr(), https.local_addr()) {
            (Ok(http), Ok(https)) => BoundAddrs { http, https },
            (Err(e), _) | (_, Err(e)) => {
                self.release_on_failed_start().await;
                return Err(RouterError::Bind(e));
            }
        };
        *self.bound.lock().expect("bound lock poisoned") = Some(bound);
        info!(http = %bound.http, https = %bound.https, "listeners bound");

        tokio::spawn(accept_loop(
            http,
            false,
            Arc::clone(&self.table),
            self.stop_tx.subscribe(),
        ));
        tokio::spawn(accept_loop(
            https,
            true,
            Arc::clone(&self.table),
            self.stop_tx.subscribe(),
        ));
        Ok(())
    }

    async fn release_on_failed_start(&self) {
        let _ = self.stop_tx.send(true);
        self.table.close_bindings().await;
    }

    /// Stop the acceptors and the sync loop and close every discovery
    /// subscription. Idempotent; in-flight connections finish naturally.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        self.table.close_bindings().await;
        info!("listener closed");
    }

    /// The concrete clear-text bind address, once started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().expect("bound lock poisoned").map(|b| b.http)
    }

    /// The concrete TLS bind address, once started.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().expect("bound lock poisoned").map(|b| b.https)
    }

    /// The live route table (lookups, refcounts, event observation).
    pub fn table(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table)
    }

    fn route_key(&self, domain: &str) -> String {
        format!(
            "{}/{}",
            self.config.route_prefix,
            domain.to_ascii_lowercase()
        )
    }

    /// Persist a route. The sync loop applies it; this call does not wait
    /// for the table to pick it up.
    pub async fn add_http_domain(
        &self,
        domain: &str,
        service: &str,
        tls_cert: &str,
        tls_key: &str,
    ) -> Result<(), RouterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::Closed);
        }
        let payload = serde_json::to_string(&RoutePayload {
            domain: domain.to_string(),
            service: service.to_string(),
            tls_cert: tls_cert.to_string(),
            tls_key: tls_key.to_string(),
        })?;
        match self.store.create(&self.route_key(domain), &payload, None).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_key_exists() => Err(RouterError::DomainExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a route from the store.
    pub async fn remove_http_domain(&self, domain: &str) -> Result<(), RouterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::Closed);
        }
        match self.store.delete(&self.route_key(domain), true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_key_not_found() => Err(RouterError::NoSuchDomain),
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribe to route add/remove events.
    pub async fn watch(&self, sink: EventSink) {
        self.table.watch(sink).await;
    }

    /// Drop an event subscription.
    pub async fn unwatch(&self, sink: &EventSink) {
        self.table.unwatch(sink).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: bool,
    table: Arc<RouteTable>,
    mut stop: watch::Receiver<bool>,
) {
    let proto = if tls { "https" } else { "http" };
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let table = Arc::clone(&table);
                    tokio::spawn(
                        handle_connection(stream, peer, tls, table)
                            .instrument(tracing::info_span!("connection", peer = %peer, proto)),
                    );
                }
                Err(e) => {
                    error!(error = %e, proto, "accept failed; stopping acceptor");
                    break;
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(proto, "acceptor stopped");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, tls: bool, table: Arc<RouteTable>) {
    if !tls {
        engine::serve_connection(stream, table, None, peer.ip(), false).await;
        return;
    }

    // TLS: no HTTP error can be sent before the handshake, so every
    // dispatch failure here closes the connection silently.
    let mut stream = stream;
    let (sni, buffered) = match peek_client_hello(&mut stream).await {
        Ok(peeked) => peeked,
        Err(e) => {
            debug!(error = %e, "failed to read client hello");
            return;
        }
    };
    let Some(host) = sni else {
        debug!("no SNI in client hello; closing");
        return;
    };
    let Some(route) = table.lookup(&host).await else {
        debug!(host = %host, "no route for SNI; closing");
        return;
    };
    let Some(tls_config) = route.tls_config() else {
        info!(domain = %route.domain(), "route has no certificate; closing TLS connection");
        return;
    };

    let acceptor = TlsAcceptor::from(tls_config);
    let replay = ReplayStream::new(buffered, stream);
    let tls_stream = match acceptor.accept(replay).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!(host = %host, error = %e, "TLS handshake failed");
            return;
        }
    };
    engine::serve_connection(tls_stream, table, Some(route), peer.ip(), true).await;
}
