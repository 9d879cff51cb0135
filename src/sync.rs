//! Store → table synchronization.
//!
//! A snapshot of the route prefix seeds the table, then a watch resumes
//! from the snapshot's logical index so no change is missed. The sync
//! loop is the table's only writer; an event that cannot be applied means
//! the table and the store have diverged, which the router cannot
//! reconcile on its own, so it aborts and lets the supervisor restart it
//! from a fresh snapshot.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::error::RouterError;
use crate::proxy::RouteTable;
use crate::store::{key_base, Store, WatchEvent};

/// Load the snapshot under `prefix` into `table`, then spawn the watch
/// loop. Returns once the table reflects the snapshot; snapshot failures
/// (other than an absent prefix) fail startup.
pub(crate) async fn start(
    store: Arc<dyn Store>,
    table: Arc<RouteTable>,
    prefix: String,
    stop: watch::Receiver<bool>,
) -> Result<(), RouterError> {
    let mut since = 0;
    match store.get(&prefix, true).await {
        Ok(subtree) => {
            since = subtree.index;
            for node in subtree.nodes {
                table.install(key_base(&node.key), &node.value).await?;
            }
        }
        // Nothing registered yet; start from an empty table.
        Err(e) if e.is_key_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    info!(
        prefix = %prefix,
        routes = table.len().await,
        index = since,
        "route snapshot loaded"
    );

    tokio::spawn(run_watch(store, table, prefix, since + 1, stop));
    Ok(())
}

async fn run_watch(
    store: Arc<dyn Store>,
    table: Arc<RouteTable>,
    prefix: String,
    from_index: u64,
    mut stop: watch::Receiver<bool>,
) {
    let (tx, mut rx) = mpsc::channel::<WatchEvent>(32);
    {
        let store = Arc::clone(&store);
        let prefix = prefix.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = store.watch(&prefix, from_index, true, tx, stop).await {
                error!(prefix = %prefix, error = %e, "store watch failed");
            }
        });
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => apply(&table, event).await,
                None => break,
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!(prefix = %prefix, "route sync stopped");
}

/// Apply one store event to the table. Divergence here is fatal.
async fn apply(table: &RouteTable, event: WatchEvent) {
    let domain = key_base(&event.node.key).to_string();
    let result = if event.action == "delete" {
        table.uninstall(&domain).await
    } else {
        table.install(&domain, &event.node.value).await
    };
    if let Err(e) = result {
        error!(
            domain = %domain,
            action = %event.action,
            error = %e,
            "cannot apply route change from store; aborting"
        );
        std::process::abort();
    }
}
