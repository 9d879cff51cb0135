//! Route table and service bindings.
//!
//! Maps exact hostnames to routes. Each route references a refcounted
//! service binding holding the discovery subscription for its backend
//! pool; the binding is created by the first route that names the service
//! and torn down when the last such route is removed.
//!
//! The sync loop is the only writer. Request-path lookups take the read
//! lock; observer notification is decoupled from mutations through an
//! internal queue drained by a dispatcher task, so events are delivered
//! to every observer in mutation order without holding any table lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::discovery::{Discovery, ServiceSet};
use crate::error::RouterError;

/// Durable form of a route, as stored under `<prefix>/<domain>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePayload {
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "TLSCert", default)]
    pub tls_cert: String,
    #[serde(rename = "TLSKey", default)]
    pub tls_key: String,
}

/// Kind of a route-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Remove,
}

/// Notification delivered to observers on route install/uninstall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub event: EventKind,
    pub domain: String,
}

/// Observer sink for route events.
pub type EventSink = mpsc::UnboundedSender<RouteEvent>;

/// Runtime pool of backend addresses for one named service.
pub struct ServiceBinding {
    name: String,
    set: Arc<dyn ServiceSet>,
    refs: AtomicUsize,
}

impl ServiceBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of routes currently referencing this binding.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Snapshot of the current backend addresses.
    pub fn addresses(&self) -> Vec<String> {
        self.set.addresses()
    }
}

/// One registered domain: service name plus optional TLS material.
pub struct Route {
    domain: String,
    service_name: String,
    tls: Option<Arc<ServerConfig>>,
    binding: Arc<ServiceBinding>,
}

impl Route {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The keypair handle, if the route is servable over TLS.
    pub fn tls_config(&self) -> Option<Arc<ServerConfig>> {
        self.tls.clone()
    }

    pub fn binding(&self) -> &Arc<ServiceBinding> {
        &self.binding
    }
}

/// Normalize a hostname for table lookup: lowercase, trailing dot
/// trimmed, any `:port` suffix stripped.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, with or without a port.
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Parse PEM cert/key material into a per-route TLS server config.
fn parse_keypair(cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>, RouterError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| RouterError::BadCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(RouterError::BadCertificate(
            "no certificate found in PEM".to_string(),
        ));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| RouterError::BadCertificate(e.to_string()))?
        .ok_or_else(|| RouterError::BadCertificate("no private key found in PEM".to_string()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RouterError::BadCertificate(e.to_string()))?;
    Ok(Arc::new(config))
}

#[derive(Default)]
struct TableState {
    domains: HashMap<String, Arc<Route>>,
    services: HashMap<String, Arc<ServiceBinding>>,
}

/// Concurrently readable hostname → route map.
pub struct RouteTable {
    discovery: Arc<dyn Discovery>,
    inner: RwLock<TableState>,
    observers: Arc<RwLock<Vec<EventSink>>>,
    events_tx: mpsc::UnboundedSender<RouteEvent>,
}

impl RouteTable {
    /// Create a table and start its event dispatcher. Must be called from
    /// within a tokio runtime.
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<RouteEvent>();
        let observers: Arc<RwLock<Vec<EventSink>>> = Arc::default();

        let fan_out = Arc::clone(&observers);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let sinks = fan_out.read().await;
                for sink in sinks.iter() {
                    // A dropped receiver just means the observer went away.
                    let _ = sink.send(event.clone());
                }
            }
        });

        Self {
            discovery,
            inner: RwLock::new(TableState::default()),
            observers,
            events_tx,
        }
    }

    /// Parse a durable payload and publish the route.
    ///
    /// The discovery subscription for a new service is opened before the
    /// write lock is taken; the sync loop being the sole writer makes the
    /// check-open-insert sequence race-free, and a spare handle is closed
    /// if a binding appeared in the meantime.
    pub async fn install(&self, domain: &str, payload: &str) -> Result<(), RouterError> {
        let payload: RoutePayload = serde_json::from_str(payload)?;
        let tls = if !payload.tls_cert.is_empty() && !payload.tls_key.is_empty() {
            Some(parse_keypair(&payload.tls_cert, &payload.tls_key)?)
        } else {
            None
        };
        let domain = domain.to_ascii_lowercase();
        let service_name = payload.service;

        loop {
            let binding_known = {
                let state = self.inner.read().await;
                if state.domains.contains_key(&domain) {
                    return Err(RouterError::DomainExists);
                }
                state.services.contains_key(&service_name)
            };
            let opened = if binding_known {
                None
            } else {
                Some(self.discovery.open_service_set(&service_name).await?)
            };

            let mut state = self.inner.write().await;
            if state.domains.contains_key(&domain) {
                if let Some(set) = opened {
                    set.close();
                }
                return Err(RouterError::DomainExists);
            }
            let binding = if let Some(existing) = state.services.get(&service_name).cloned() {
                if let Some(set) = opened {
                    set.close();
                }
                existing
            } else if let Some(set) = opened {
                let binding = Arc::new(ServiceBinding {
                    name: service_name.clone(),
                    set,
                    refs: AtomicUsize::new(0),
                });
                state
                    .services
                    .insert(service_name.clone(), Arc::clone(&binding));
                binding
            } else {
                // The binding vanished between the check and the insert;
                // redo the sequence with a fresh subscription.
                continue;
            };
            binding.refs.fetch_add(1, Ordering::SeqCst);
            state.domains.insert(
                domain.clone(),
                Arc::new(Route {
                    domain: domain.clone(),
                    service_name: service_name.clone(),
                    tls,
                    binding,
                }),
            );
            drop(state);

            info!(domain = %domain, service = %service_name, "route installed");
            let _ = self.events_tx.send(RouteEvent {
                event: EventKind::Add,
                domain,
            });
            return Ok(());
        }
    }

    /// Drop the route, tearing down its binding at refcount zero.
    pub async fn uninstall(&self, domain: &str) -> Result<(), RouterError> {
        let domain = domain.to_ascii_lowercase();
        {
            let mut state = self.inner.write().await;
            let route = state
                .domains
                .remove(&domain)
                .ok_or(RouterError::NoSuchDomain)?;
            let binding = Arc::clone(&route.binding);
            if binding.refs.fetch_sub(1, Ordering::SeqCst) <= 1 {
                state.services.remove(binding.name());
                binding.set.close();
            }
        }

        info!(domain = %domain, "route uninstalled");
        let _ = self.events_tx.send(RouteEvent {
            event: EventKind::Remove,
            domain,
        });
        Ok(())
    }

    /// Exact-match lookup on the normalized host.
    pub async fn lookup(&self, host: &str) -> Option<Arc<Route>> {
        let host = normalize_host(host);
        let state = self.inner.read().await;
        let route = state.domains.get(&host).cloned();
        debug!(host = %host, matched = route.is_some(), "route lookup");
        route
    }

    /// Register an observer for add/remove events.
    pub async fn watch(&self, sink: EventSink) {
        self.observers.write().await.push(sink);
    }

    /// Deregister an observer. Undelivered events are simply dropped with
    /// the sender; an in-flight dispatch cannot block on an unbounded sink.
    pub async fn unwatch(&self, sink: &EventSink) {
        self.observers.write().await.retain(|s| !s.same_channel(sink));
    }

    /// Close every binding's discovery subscription (listener shutdown).
    pub async fn close_bindings(&self) {
        let state = self.inner.read().await;
        for binding in state.services.values() {
            binding.set.close();
        }
    }

    /// Number of installed routes.
    pub async fn len(&self) -> usize {
        self.inner.read().await.domains.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.domains.is_empty()
    }

    /// Refcount of the named service's binding, if one exists.
    pub async fn service_refs(&self, service: &str) -> Option<usize> {
        let state = self.inner.read().await;
        state.services.get(service).map(|b| b.refs())
    }
}
