//! In-memory discovery for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use super::{Discovery, DiscoveryError, ServiceSet};

#[derive(Default)]
struct Inner {
    sets: HashMap<String, Arc<MemoryServiceSet>>,
    failing: HashMap<String, String>,
}

/// A process-local [`Discovery`] whose address sets are driven by the
/// caller instead of an external registry.
#[derive(Default)]
pub struct MemoryDiscovery {
    inner: Mutex<Inner>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the address set for `service`, creating it if needed.
    pub fn set_addresses(&self, service: &str, addrs: Vec<String>) {
        let set = self.get_or_create(service);
        set.addrs.store(Arc::new(addrs));
    }

    /// Make the next `open_service_set(service)` fail with `reason`.
    pub fn fail_service(&self, service: &str, reason: &str) {
        let mut inner = self.inner.lock().expect("discovery lock poisoned");
        inner.failing.insert(service.to_string(), reason.to_string());
    }

    /// The set handle for `service`, if one was ever opened or seeded.
    pub fn service_set(&self, service: &str) -> Option<Arc<MemoryServiceSet>> {
        let inner = self.inner.lock().expect("discovery lock poisoned");
        inner.sets.get(service).cloned()
    }

    fn get_or_create(&self, service: &str) -> Arc<MemoryServiceSet> {
        let mut inner = self.inner.lock().expect("discovery lock poisoned");
        inner
            .sets
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(MemoryServiceSet::default()))
            .clone()
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn open_service_set(&self, name: &str) -> Result<Arc<dyn ServiceSet>, DiscoveryError> {
        {
            let mut inner = self.inner.lock().expect("discovery lock poisoned");
            if let Some(reason) = inner.failing.remove(name) {
                return Err(DiscoveryError::Subscribe {
                    service: name.to_string(),
                    reason,
                });
            }
        }
        let set = self.get_or_create(name);
        set.closed.store(false, Ordering::SeqCst);
        Ok(set)
    }
}

/// Address set handle handed out by [`MemoryDiscovery`].
#[derive(Default)]
pub struct MemoryServiceSet {
    addrs: ArcSwap<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryServiceSet {
    /// Whether `close` has been called since the set was last opened.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ServiceSet for MemoryServiceSet {
    fn addresses(&self) -> Vec<String> {
        self.addrs.load().as_ref().clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
