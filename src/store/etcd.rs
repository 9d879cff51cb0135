//! Coordination-store client over the etcd v2 HTTP API.
//!
//! Watches are long-polls against `?wait=true&waitIndex=N`; the logical
//! index comes back in the `X-Etcd-Index` header. Transport failures during
//! a watch retry after a short delay; structured API errors propagate.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use super::{Store, StoreError, StoreNode, Subtree, WatchEvent};

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Error code etcd returns when the requested watch index has been
/// compacted out of the event history.
const CODE_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    node: Option<WireNode>,
}

#[derive(Debug, Deserialize)]
struct WireNode {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    index: u64,
}

/// Collect the leaf entries of a (possibly nested) directory node.
fn leaves(node: WireNode, out: &mut Vec<StoreNode>) {
    if node.dir {
        for child in node.nodes {
            leaves(child, out);
        }
    } else {
        out.push(StoreNode {
            key: node.key,
            value: node.value,
        });
    }
}

/// [`Store`] implementation speaking the etcd v2 HTTP API.
pub struct EtcdStore {
    base_url: String,
    client: reqwest::Client,
}

impl EtcdStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.base_url, key)
    }

    /// Decode a non-success response body into a structured error.
    async fn api_error(resp: reqwest::Response) -> StoreError {
        let status = resp.status();
        match resp.json::<WireError>().await {
            Ok(body) => StoreError::Api {
                code: body.error_code,
                message: body.message,
            },
            Err(_) => StoreError::Transport(format!("unexpected store response: {status}")),
        }
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn create(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), StoreError> {
        let mut form = vec![
            ("value".to_string(), value.to_string()),
            ("prevExist".to_string(), "false".to_string()),
        ];
        if let Some(ttl) = ttl {
            form.push(("ttl".to_string(), ttl.to_string()));
        }
        let resp = self
            .client
            .put(self.key_url(key))
            .form(&form)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        Ok(())
    }

    async fn get(&self, key: &str, recursive: bool) -> Result<Subtree, StoreError> {
        let resp = self
            .client
            .get(self.key_url(key))
            .query(&[("recursive", recursive)])
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let index = resp
            .headers()
            .get("x-etcd-index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let body: WireResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let mut nodes = Vec::new();
        if let Some(node) = body.node {
            leaves(node, &mut nodes);
        }
        Ok(Subtree { index, nodes })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.key_url(key))
            .query(&[("recursive", recursive)])
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        from_index: u64,
        recursive: bool,
        sink: mpsc::Sender<WatchEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let mut wait_index = from_index;
        loop {
            let request = self
                .client
                .get(self.key_url(prefix))
                .query(&[
                    ("wait", "true".to_string()),
                    ("recursive", recursive.to_string()),
                    ("waitIndex", wait_index.to_string()),
                ])
                .send();

            let resp = tokio::select! {
                resp = request => resp,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };

            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, prefix, "store watch poll failed; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return Ok(());
                            }
                            continue;
                        }
                    }
                }
            };

            if !resp.status().is_success() {
                let status = resp.status();
                match resp.json::<WireError>().await {
                    // The watch window fell behind the store's event
                    // history; resume from the index the store reports.
                    Ok(body) if body.error_code == CODE_INDEX_CLEARED => {
                        wait_index = wait_index.max(body.index + 1);
                        continue;
                    }
                    Ok(body) => {
                        return Err(StoreError::Api {
                            code: body.error_code,
                            message: body.message,
                        })
                    }
                    Err(_) => {
                        return Err(StoreError::Transport(format!(
                            "unexpected store response: {status}"
                        )))
                    }
                }
            }

            let body: WireResponse = match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, prefix, "store watch body undecodable; retrying");
                    continue;
                }
            };

            let (Some(action), Some(node)) = (body.action, body.node) else {
                continue;
            };
            wait_index = wait_index.max(node.modified_index + 1);
            let event = WatchEvent {
                action,
                node: StoreNode {
                    key: node.key,
                    value: node.value,
                },
            };
            if sink.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}
