//! Store-backed discovery.
//!
//! Service members are registered as leaf keys under
//! `<prefix>/<service>/…`, value = the member's `host:port` (falling back
//! to the last key segment). A service set snapshots the subtree, then
//! follows the watch stream so the address list tracks registrations and
//! deregistrations for the life of the subscription.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{Discovery, DiscoveryError, ServiceSet};
use crate::store::{key_base, Store, StoreNode, WatchEvent};

/// [`Discovery`] implementation reading membership from the
/// coordination store.
pub struct StoreDiscovery {
    store: Arc<dyn Store>,
    prefix: String,
}

impl StoreDiscovery {
    pub fn new(store: Arc<dyn Store>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Discovery for StoreDiscovery {
    async fn open_service_set(&self, name: &str) -> Result<Arc<dyn ServiceSet>, DiscoveryError> {
        let key = format!("{}/{}", self.prefix, name);

        let (index, nodes) = match self.store.get(&key, true).await {
            Ok(subtree) => (subtree.index, subtree.nodes),
            // No members registered yet; start empty and rely on the watch.
            Err(e) if e.is_key_not_found() => (0, Vec::new()),
            Err(e) => {
                return Err(DiscoveryError::Subscribe {
                    service: name.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let set = Arc::new(StoreServiceSet::new(name, nodes));

        let (tx, mut rx) = mpsc::channel(32);
        let stop_rx = set.stop_tx.subscribe();
        let store = self.store.clone();
        let watch_key = key.clone();
        let service = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.watch(&watch_key, index + 1, true, tx, stop_rx).await {
                warn!(service = %service, error = %e, "discovery watch ended");
            }
        });

        let applier = Arc::clone(&set);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                applier.apply(event);
            }
        });

        Ok(set)
    }
}

/// Membership of one service, kept fresh by the watch task.
struct StoreServiceSet {
    name: String,
    /// `store key -> address`; the source of the published snapshot.
    members: Mutex<BTreeMap<String, String>>,
    /// Lock-free snapshot read by request handlers.
    addrs: ArcSwap<Vec<String>>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

fn member_address(node: &StoreNode) -> String {
    if node.value.is_empty() {
        key_base(&node.key).to_string()
    } else {
        node.value.clone()
    }
}

impl StoreServiceSet {
    fn new(name: &str, nodes: Vec<StoreNode>) -> Self {
        let members: BTreeMap<String, String> = nodes
            .iter()
            .map(|n| (n.key.clone(), member_address(n)))
            .collect();
        let addrs = members.values().cloned().collect::<Vec<_>>();
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            members: Mutex::new(members),
            addrs: ArcSwap::from_pointee(addrs),
            stop_tx,
            closed: AtomicBool::new(false),
        }
    }

    fn apply(&self, event: WatchEvent) {
        let mut members = self.members.lock().expect("member lock poisoned");
        if event.action == "delete" || event.action == "expire" {
            members.remove(&event.node.key);
        } else {
            members.insert(event.node.key.clone(), member_address(&event.node));
        }
        let snapshot: Vec<String> = members.values().cloned().collect();
        debug!(service = %self.name, members = snapshot.len(), "service membership changed");
        self.addrs.store(Arc::new(snapshot));
    }
}

impl ServiceSet for StoreServiceSet {
    fn addresses(&self) -> Vec<String> {
        self.addrs.load().as_ref().clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }
}
