use std::sync::Arc;
use std::time::Duration;

use netmesh_inventory::{Inventory, NodeSource, PatchError};
use netmesh_routing::Provider;
use tracing::{error, info, warn};

use crate::cni;

const OK_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_INTERVAL: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ReconcilerConfig {
    pub cni_config_path: Option<String>,
}

/// Drives the active backend against inventory snapshots: §4.3's
/// tick-once-per-second loop, with node-status patching and CNI config
/// rewriting folded in after each attempt.
pub async fn run(
    inventory: Arc<Inventory>,
    provider: Arc<dyn Provider>,
    node_source: Arc<dyn NodeSource>,
    config: ReconcilerConfig,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            return;
        }

        if !inventory.is_ready() {
            if sleep_or_cancel(READY_POLL_INTERVAL, &mut cancel).await {
                return;
            }
            continue;
        }

        let sleep_for = match provider.ensure(&inventory).await {
            Ok(()) => OK_INTERVAL,
            Err(err) => {
                error!(error = ?err, "reconcile failed");
                ERROR_INTERVAL
            }
        };

        patch_network_available(&inventory, &node_source).await;
        rewrite_cni_config(&inventory, config.cni_config_path.as_deref());

        if sleep_or_cancel(sleep_for, &mut cancel).await {
            return;
        }
    }
}

/// Sleeps for `duration` unless cancellation fires first. Returns
/// whether the caller should stop.
async fn sleep_or_cancel(duration: Duration, cancel: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        result = cancel.changed() => result.is_err() || *cancel.borrow(),
    }
}

async fn patch_network_available(inventory: &Inventory, node_source: &Arc<dyn NodeSource>) {
    let snapshot = inventory.snapshot();
    let Some(self_node) = snapshot.self_node else {
        return;
    };
    if self_node.network_available {
        return;
    }
    match node_source.patch_network_unavailable(&self_node.name, false).await {
        Ok(()) => info!(node = %self_node.name, "cleared NetworkUnavailable condition"),
        Err(PatchError::Conflict) => {}
        Err(PatchError::Other(err)) => warn!(error = ?err, "failed to patch node status"),
    }
}

fn rewrite_cni_config(inventory: &Inventory, path: Option<&str>) {
    let Some(path) = path else {
        return;
    };
    let snapshot = inventory.snapshot();
    let Some(self_node) = snapshot.self_node else {
        return;
    };
    let Some(pod_cidr) = self_node.pod_cidr else {
        return;
    };
    match cni::write_if_changed(path, pod_cidr) {
        Ok(true) => info!(%path, "wrote CNI configuration"),
        Ok(false) => {}
        Err(err) => warn!(error = ?err, "failed to write CNI configuration"),
    }
}
