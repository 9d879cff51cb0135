//! In-memory store with watchable change streams.
//!
//! Implements the same error-code and watch-resume semantics as the real
//! store, for integration tests and single-process embedding. Every change
//! is appended to an event log so a watch starting at an old index replays
//! history before going live.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{Store, StoreError, StoreNode, Subtree, WatchEvent};

#[derive(Default)]
struct Inner {
    index: u64,
    entries: BTreeMap<String, String>,
    log: Vec<(u64, WatchEvent)>,
    watchers: Vec<Watcher>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// A process-local [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(inner: &mut Inner, action: &str, key: &str, value: &str) {
        inner.index += 1;
        let event = WatchEvent {
            action: action.to_string(),
            node: StoreNode {
                key: key.to_string(),
                value: value.to_string(),
            },
        };
        inner.log.push((inner.index, event.clone()));
        inner
            .watchers
            .retain(|w| !key_matches(&w.prefix, key) || w.tx.send(event.clone()).is_ok());
    }
}

fn key_matches(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key == prefix || key.starts_with(&format!("{prefix}/"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, key: &str, value: &str, _ttl: Option<u64>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.entries.contains_key(key) {
            return Err(StoreError::key_exists(key));
        }
        inner.entries.insert(key.to_string(), value.to_string());
        Self::record(&mut inner, "create", key, value);
        Ok(())
    }

    async fn get(&self, key: &str, recursive: bool) -> Result<Subtree, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let nodes: Vec<StoreNode> = inner
            .entries
            .iter()
            .filter(|(k, _)| if recursive { key_matches(key, k) } else { k.as_str() == key })
            .map(|(k, v)| StoreNode {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        if nodes.is_empty() {
            return Err(StoreError::key_not_found(key));
        }
        Ok(Subtree {
            index: inner.index,
            nodes,
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let mut removed: Vec<String> = Vec::new();
        if inner.entries.remove(key).is_some() {
            removed.push(key.to_string());
        }
        if recursive {
            let children: Vec<String> = inner
                .entries
                .keys()
                .filter(|k| key_matches(key, k))
                .cloned()
                .collect();
            for child in children {
                inner.entries.remove(&child);
                removed.push(child);
            }
        }
        if removed.is_empty() {
            return Err(StoreError::key_not_found(key));
        }
        for key in removed {
            Self::record(&mut inner, "delete", &key, "");
        }
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        from_index: u64,
        _recursive: bool,
        sink: mpsc::Sender<WatchEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            // Replay and register under one lock so no event is missed
            // between the two.
            let mut inner = self.inner.lock().expect("store lock poisoned");
            for (index, event) in &inner.log {
                if *index >= from_index && key_matches(prefix, &event.node.key) {
                    let _ = tx.send(event.clone());
                }
            }
            inner.watchers.push(Watcher {
                prefix: prefix.to_string(),
                tx,
            });
        }

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if sink.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
