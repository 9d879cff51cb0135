//! Error types for route administration and table mutation.

use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::store::StoreError;

/// Errors surfaced by the listener's admin API and the route table.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The listener has been closed; admin operations are rejected.
    #[error("listener has been closed")]
    Closed,

    /// A route for the domain is already registered.
    #[error("domain already exists")]
    DomainExists,

    /// No route is registered for the domain.
    #[error("domain does not exist")]
    NoSuchDomain,

    /// The route's TLS material could not be parsed into a keypair.
    #[error("invalid certificate or key: {0}")]
    BadCertificate(String),

    /// The durable route payload could not be deserialized.
    #[error("invalid route payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    /// Opening the discovery subscription for a service failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Unclassified coordination-store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A frontend listener could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}
