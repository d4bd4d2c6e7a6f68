use anyhow::{Context, Result};
use async_trait::async_trait;
use netmesh_inventory::Inventory;
use netmesh_kernel::route::{diff_routes, Route, RouteTable};
use rtnetlink::Handle;
use tracing::warn;

use crate::{Provider, VersionGate};

/// Routes pod traffic directly to each remote node's underlay address,
/// assuming every node sits on a shared layer-2 segment.
pub struct Layer2Provider {
    link_index: u32,
    routes: RouteTable,
    version_gate: VersionGate,
}

impl Layer2Provider {
    /// Resolves `link_name` to an index once; failure here is fatal,
    /// the backend has no route to remote nodes without it.
    pub async fn new(handle: Handle, link_name: &str) -> Result<Self> {
        let link_index = netmesh_kernel::link::LinkTable::new(handle.clone())
            .index_of(link_name)
            .await
            .with_context(|| format!("resolving layer-2 underlay device {link_name}"))?;
        Ok(Self {
            link_index,
            routes: RouteTable::new(handle),
            version_gate: VersionGate::new(),
        })
    }
}

#[async_trait]
impl Provider for Layer2Provider {
    async fn ensure(&self, inventory: &Inventory) -> Result<()> {
        if self.version_gate.matches(inventory) {
            return Ok(());
        }

        let snapshot = inventory.snapshot();
        let Some(self_node) = snapshot.self_node else {
            warn!("self node not present in inventory, skipping layer-2 reconcile");
            return Ok(());
        };

        let desired: Vec<Route> = snapshot
            .nodes
            .values()
            .filter(|n| n.name != self_node.name)
            .filter_map(|n| {
                let cidr = n.pod_cidr?;
                let gateway = n.underlay_address?;
                Some(Route {
                    destination: cidr,
                    link_index: self.link_index,
                    gateway: Some(gateway),
                    source: None,
                    protocol: 0,
                    table: 254,
                    scope: 0,
                    onlink: false,
                })
            })
            .collect();

        let current = self.routes.list().await.context("listing routes")?;
        let plan = diff_routes(&current, &desired, false);
        self.routes.apply(&plan).await?;
        self.version_gate.record(snapshot.version);
        Ok(())
    }
}
