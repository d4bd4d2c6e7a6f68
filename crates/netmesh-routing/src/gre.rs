use anyhow::{Context, Result};
use async_trait::async_trait;
use netmesh_inventory::Inventory;
use netmesh_kernel::link::{diff_links, Link, LinkKind, LinkTable};
use netmesh_kernel::route::{diff_routes, Route, RouteTable};
use rtnetlink::Handle;

use crate::derive::build_tunnel_name;
use crate::{Provider, VersionGate};

const PREFIX: &str = "k8s-";
const TTL: u8 = 255;

/// One point-to-point GRE tunnel per remote node, named from the
/// remote pod CIDR's network address.
pub struct GreProvider {
    links: LinkTable,
    routes: RouteTable,
    version_gate: VersionGate,
}

impl GreProvider {
    pub fn new(handle: Handle) -> Self {
        Self {
            links: LinkTable::new(handle.clone()),
            routes: RouteTable::new(handle),
            version_gate: VersionGate::new(),
        }
    }
}

#[async_trait]
impl Provider for GreProvider {
    async fn ensure(&self, inventory: &Inventory) -> Result<()> {
        if self.version_gate.matches(inventory) {
            return Ok(());
        }

        let snapshot = inventory.snapshot();
        let Some(self_node) = snapshot.self_node else {
            return Ok(());
        };
        let Some(self_underlay) = self_node.underlay_address else {
            return Ok(());
        };

        let peers: Vec<_> = snapshot
            .nodes
            .values()
            .filter(|n| n.name != self_node.name)
            .filter_map(|n| Some((n, n.pod_cidr?, n.underlay_address?)))
            .collect();

        let desired_links: Vec<Link> = peers
            .iter()
            .map(|(_, cidr, underlay)| Link {
                name: build_tunnel_name(cidr.network()),
                kind: LinkKind::Gre {
                    local: self_underlay,
                    remote: *underlay,
                    ttl: TTL,
                },
                hardware_address: None,
                mtu: None,
                up: true,
            })
            .collect();

        let current_links = self.links.list_by_prefix(PREFIX).await.context("listing GRE tunnels")?;
        let link_plan = diff_links(&current_links, &desired_links);
        self.links.apply(&link_plan).await.context("applying GRE tunnel plan")?;

        for link in &desired_links {
            self.links.set_up(&link.name).await.context("bringing up GRE tunnel")?;
        }

        let mut desired_routes = Vec::with_capacity(peers.len());
        for (_, cidr, _) in &peers {
            let name = build_tunnel_name(cidr.network());
            let link_index = self.links.index_of(&name).await.context("resolving tunnel index")?;
            desired_routes.push(Route {
                destination: *cidr,
                link_index,
                gateway: None,
                source: None,
                protocol: 0,
                table: 254,
                scope: 0,
                onlink: false,
            });
        }

        let current_routes = self.routes.list().await.context("listing routes")?;
        let route_plan = diff_routes(&current_routes, &desired_routes, false);
        self.routes.apply(&route_plan).await?;
        self.version_gate.record(snapshot.version);
        Ok(())
    }
}
