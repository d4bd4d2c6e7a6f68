use std::net::Ipv4Addr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use netmesh_inventory::Inventory;
use netmesh_kernel::link::{Link, LinkKind, LinkTable};
use netmesh_kernel::neigh::{diff_neighs, Neigh, NeighTable, NUD_PERMANENT, NTF_SELF};
use netmesh_kernel::diff::Plan;
use netmesh_kernel::route::{diff_routes, Route, RouteTable};
use rtnetlink::Handle;

use crate::derive::map_to_mac;
use crate::{Provider, VersionGate};

pub mod monitor;

const DEVICE_NAME: &str = "vxlan1";
const VNI: u32 = 1;
const VXLAN_PORT: u16 = 4789;
const AF_INET: u16 = 2;
const AF_BRIDGE: u16 = 7;

/// A single overlay device carrying pod-to-pod traffic to every remote
/// node. The agent populates its FDB and ARP tables itself; kernel
/// learning is disabled.
pub struct VxlanProvider {
    links: LinkTable,
    neighs: NeighTable,
    routes: RouteTable,
    underlying_link_name: String,
    version_gate: VersionGate,
}

impl VxlanProvider {
    pub fn new(handle: Handle, underlying_link_name: impl Into<String>) -> Self {
        Self {
            links: LinkTable::new(handle.clone()),
            neighs: NeighTable::new(handle.clone()),
            routes: RouteTable::new(handle),
            underlying_link_name: underlying_link_name.into(),
            version_gate: VersionGate::new(),
        }
    }

    async fn underlying_mtu(&self) -> Result<u32> {
        let link = self
            .links
            .get_by_name(&self.underlying_link_name)
            .await?
            .ok_or_else(|| anyhow!("underlay device {} not found", self.underlying_link_name))?;
        link.mtu
            .ok_or_else(|| anyhow!("underlay device {} reports no mtu", self.underlying_link_name))
    }

    /// Creates the vxlan device on first reconcile, or reuses and
    /// reconfigures it in place without tearing it down.
    async fn ensure_device(&self, self_cidr: Ipv4Network, self_underlay: Ipv4Addr) -> Result<u32> {
        let mtu = self.underlying_mtu().await?.saturating_sub(100);
        let mac = map_to_mac(self_cidr.network());

        let desired = Link {
            name: DEVICE_NAME.to_string(),
            kind: LinkKind::Vxlan {
                vni: VNI,
                port: VXLAN_PORT,
                local: self_underlay,
                learning: false,
            },
            hardware_address: Some(mac),
            mtu: Some(mtu),
            up: true,
        };

        match self.links.get_by_name(DEVICE_NAME).await.context("looking up vxlan device")? {
            Some(existing) => {
                let needs_update =
                    existing.hardware_address != desired.hardware_address || existing.mtu != desired.mtu || !existing.up;
                if needs_update {
                    let plan = Plan {
                        create: vec![],
                        update: vec![desired],
                        remove: vec![],
                    };
                    self.links.apply(&plan).await.context("reconfiguring vxlan device")?;
                }
            }
            None => {
                let plan = Plan {
                    create: vec![desired],
                    update: vec![],
                    remove: vec![],
                };
                self.links.apply(&plan).await.context("creating vxlan device")?;
            }
        }

        self.links
            .ensure_address(DEVICE_NAME, self_cidr.ip())
            .await
            .context("assigning vxlan device address")?;
        self.links.index_of(DEVICE_NAME).await.context("resolving vxlan device index")
    }
}

#[async_trait]
impl Provider for VxlanProvider {
    async fn ensure(&self, inventory: &Inventory) -> Result<()> {
        if self.version_gate.matches(inventory) {
            return Ok(());
        }

        let snapshot = inventory.snapshot();
        let Some(self_node) = snapshot.self_node else {
            anyhow::bail!("self node not present in inventory");
        };
        let self_cidr = self_node
            .pod_cidr
            .ok_or_else(|| anyhow!("self node {} has no pod CIDR", self_node.name))?;
        let self_underlay = self_node
            .underlay_address
            .ok_or_else(|| anyhow!("self node {} has no underlay address", self_node.name))?;

        let device_index = self.ensure_device(self_cidr, self_underlay).await?;

        let peers: Vec<_> = snapshot
            .nodes
            .values()
            .filter(|n| n.name != self_node.name)
            .filter_map(|n| Some((n, n.pod_cidr?, n.underlay_address?)))
            .collect();

        let mut desired_neighs = Vec::with_capacity(peers.len() * 2);
        for (_, cidr, underlay) in &peers {
            let mac = map_to_mac(cidr.network());
            desired_neighs.push(Neigh {
                link_index: device_index,
                ip: cidr.network(),
                family: AF_INET,
                state: NUD_PERMANENT,
                flags: 0,
                hardware_address: mac,
            });
            desired_neighs.push(Neigh {
                link_index: device_index,
                ip: *underlay,
                family: AF_BRIDGE,
                state: NUD_PERMANENT,
                flags: NTF_SELF,
                hardware_address: mac,
            });
        }

        let mut current_neighs = self.neighs.list(device_index, AF_INET).await.context("listing ARP entries")?;
        current_neighs.extend(self.neighs.list(device_index, AF_BRIDGE).await.context("listing FDB entries")?);
        let neigh_plan = diff_neighs(&current_neighs, &desired_neighs);
        self.neighs.apply(&neigh_plan).await.context("applying neighbor plan")?;

        let desired_routes: Vec<Route> = peers
            .iter()
            .map(|(_, cidr, _)| Route {
                destination: *cidr,
                link_index: device_index,
                gateway: Some(cidr.network()),
                source: None,
                protocol: 0,
                table: 254,
                scope: 0, // RT_SCOPE_UNIVERSE
                onlink: true,
            })
            .collect();

        let current_routes = self.routes.list().await.context("listing routes")?;
        let route_plan = diff_routes(&current_routes, &desired_routes, true);
        self.routes.apply(&route_plan).await?;
        self.version_gate.record(snapshot.version);
        Ok(())
    }
}
