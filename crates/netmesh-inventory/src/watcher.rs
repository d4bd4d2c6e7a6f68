use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch as cancel_watch;
use tracing::{error, info, warn};

use crate::client::{NodeEvent, NodeSource};
use crate::inventory::Inventory;

const BACKOFF: Duration = Duration::from_secs(10);

/// Keeps `inventory` synchronized with `source`'s node stream until
/// `cancel` is signalled. Runs list-then-watch iterations forever,
/// retrying after a ten-second back-off on any failure.
pub async fn watch(
    source: Arc<dyn NodeSource>,
    inventory: Arc<Inventory>,
    mut cancel: cancel_watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            return;
        }

        match run_iteration(&source, &inventory, &mut cancel).await {
            Ok(()) => {}
            Err(err) => {
                warn!(error = ?err, "inventory watch iteration failed, backing off");
            }
        }

        if *cancel.borrow() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(BACKOFF) => {}
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_iteration(
    source: &Arc<dyn NodeSource>,
    inventory: &Arc<Inventory>,
    cancel: &mut cancel_watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (nodes, resource_version) = source.list().await?;
    let records = nodes.iter().map(|n| n.to_record()).collect();
    inventory.replace_all(records);
    inventory.mark_ready();
    info!(count = nodes.len(), %resource_version, "inventory list complete");

    let mut stream = source.watch(&resource_version).await?;

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(NodeEvent::Added(raw))) | Some(Ok(NodeEvent::Modified(raw))) => {
                        inventory.update_node(raw.to_record());
                    }
                    Some(Ok(NodeEvent::Deleted(name))) => {
                        inventory.remove_node(&name);
                    }
                    Some(Err(err)) => {
                        error!(error = ?err, "watch stream protocol error");
                        return Err(err);
                    }
                    None => return Ok(()),
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
