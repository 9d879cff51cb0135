//! Service-discovery seam.
//!
//! A [`ServiceSet`] is the live membership of one named backend pool. The
//! router never mutates the address list; it reads snapshots on the request
//! path and closes the handle when the last route referencing the service
//! goes away.

mod memory;
mod store;

pub use memory::{MemoryDiscovery, MemoryServiceSet};
pub use store::StoreDiscovery;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Failure to open a discovery subscription.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery subscription for service {service} failed: {reason}")]
    Subscribe { service: String, reason: String },
}

/// Live address set of one named service.
pub trait ServiceSet: Send + Sync {
    /// Snapshot of the current `host:port` members. Safe to call from
    /// request handlers without locking.
    fn addresses(&self) -> Vec<String>;

    /// Stop tracking membership and release the subscription.
    fn close(&self);
}

/// Discovery client: one subscription handle per named service.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn open_service_set(&self, name: &str) -> Result<Arc<dyn ServiceSet>, DiscoveryError>;
}
