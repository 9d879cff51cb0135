//! Coordination-store seam.
//!
//! Routes are durably owned by a replicated key/value store with watchable
//! change streams. The router consumes four operations: `create`, recursive
//! `get`, `delete`, and a resumable `watch`. Structured error codes follow
//! the etcd v2 convention: 100 = key not found, 105 = key already exists.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Error code for "key not found".
pub const CODE_KEY_NOT_FOUND: u64 = 100;

/// Error code for "key already exists".
pub const CODE_KEY_EXISTS: u64 = 105;

/// Failures returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected the operation with a structured error code.
    #[error("store error {code}: {message}")]
    Api { code: u64, message: String },

    /// The store could not be reached or returned an unusable response.
    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn key_not_found(key: &str) -> Self {
        Self::Api {
            code: CODE_KEY_NOT_FOUND,
            message: format!("Key not found: {key}"),
        }
    }

    pub fn key_exists(key: &str) -> Self {
        Self::Api {
            code: CODE_KEY_EXISTS,
            message: format!("Key already exists: {key}"),
        }
    }

    /// The structured error code, if the store produced one.
    pub fn code(&self) -> Option<u64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }

    pub fn is_key_not_found(&self) -> bool {
        self.code() == Some(CODE_KEY_NOT_FOUND)
    }

    pub fn is_key_exists(&self) -> bool {
        self.code() == Some(CODE_KEY_EXISTS)
    }
}

/// A single key/value entry in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: String,
}

/// Result of a recursive `get`: the subtree plus the store's logical index.
///
/// The index anchors a subsequent `watch` so no change is missed between
/// snapshot and subscription.
#[derive(Debug, Clone)]
pub struct Subtree {
    pub index: u64,
    pub nodes: Vec<StoreNode>,
}

/// One change observed by a watch subscription.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Store action, e.g. `create`, `set`, `delete`, `expire`.
    pub action: String,
    pub node: StoreNode,
}

/// The store operations the router consumes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create `key` with `value`; fails with code 105 if the key exists.
    async fn create(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), StoreError>;

    /// Fetch the subtree under `key`; fails with code 100 if absent.
    async fn get(&self, key: &str, recursive: bool) -> Result<Subtree, StoreError>;

    /// Delete `key` (and children when `recursive`); code 100 if absent.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError>;

    /// Stream changes under `prefix` starting at `from_index` into `sink`
    /// until `stop` fires or the sink is dropped.
    async fn watch(
        &self,
        prefix: &str,
        from_index: u64,
        recursive: bool,
        sink: mpsc::Sender<WatchEvent>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), StoreError>;
}

/// Last path segment of a store key, i.e. the domain in `<prefix>/<domain>`.
pub fn key_base(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or(key)
}
