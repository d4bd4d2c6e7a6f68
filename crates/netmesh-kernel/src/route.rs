use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::Handle;

use crate::diff::{self, Plan};

/// A single IPv4 route, keyed for diffing by its destination prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Network,
    pub link_index: u32,
    pub gateway: Option<Ipv4Addr>,
    pub source: Option<Ipv4Addr>,
    pub protocol: u8,
    pub table: u32,
    pub scope: u8,
    pub onlink: bool,
}

impl Route {
    fn key(&self) -> Ipv4Network {
        self.destination
    }
}

pub fn diff_routes(current: &[Route], desired: &[Route], delete_extras: bool) -> Plan<Route> {
    diff::diff(current, desired, delete_extras, Route::key, |a, b| a == b)
}

pub struct RouteTable {
    handle: Handle,
}

impl RouteTable {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub async fn list(&self) -> Result<Vec<Route>> {
        let mut routes = Vec::new();
        let mut stream = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(msg) = stream.try_next().await.context("listing routes")? {
            if let Some(route) = parse_route(&msg) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    /// Applies `plan`: removes first, then creates, then updates
    /// (updates are modeled as a delete-then-recreate, the kernel
    /// offers no atomic route replace across differing gateways).
    pub async fn apply(&self, plan: &Plan<Route>) -> Result<()> {
        for route in &plan.remove {
            self.delete(route).await?;
        }
        for route in plan.create.iter().chain(plan.update.iter()) {
            if plan.update.contains(route) {
                let _ = self.delete(route).await;
            }
            self.create(route).await?;
        }
        Ok(())
    }

    async fn create(&self, route: &Route) -> Result<()> {
        let mut req = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.destination.ip(), route.destination.prefix())
            .output_interface(route.link_index);

        if let Some(gw) = route.gateway {
            req = req.gateway(gw);
        }
        if let Some(src) = route.source {
            req = req.source_prefix(src, 32);
        }
        if route.onlink {
            const RTNH_F_ONLINK: u32 = 4;
            req.message_mut().header.flags |= RTNH_F_ONLINK.into();
        }

        req.execute()
            .await
            .with_context(|| format!("adding route {}", route.destination))
    }

    async fn delete(&self, route: &Route) -> Result<()> {
        let mut stream = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(msg) = stream.try_next().await.context("listing routes for delete")? {
            if let Some(current) = parse_route(&msg) {
                if current.destination == route.destination && current.link_index == route.link_index {
                    match self.handle.route().del(msg).execute().await {
                        Ok(()) => {}
                        Err(rtnetlink::Error::NetlinkError(e)) if e.code.map(|c| c.get()) == Some(-libc::ESRCH) => {
                            // already gone, kernel delete of a vanished object is silent
                        }
                        Err(e) => return Err(e).context("deleting route"),
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_route(msg: &RouteMessage) -> Option<Route> {
    let header = &msg.header;
    let mut destination = None;
    let mut gateway = None;
    let mut source = None;
    let mut link_index = 0u32;

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                destination = Some(*addr);
            }
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => {
                gateway = Some(*addr);
            }
            RouteAttribute::Source(RouteAddress::Inet(addr)) => {
                source = Some(*addr);
            }
            RouteAttribute::Oif(idx) => {
                link_index = *idx;
            }
            _ => {}
        }
    }

    let destination = destination?;
    let network = Ipv4Network::new(destination, header.destination_prefix_length).ok()?;

    // RTNH_F_ONLINK, see linux/rtnetlink.h; not modeled as its own
    // enum variant in netlink-packet-route's RouteHeader flags.
    const RTNH_F_ONLINK: u8 = 4;
    let onlink = (header.flags.bits() & RTNH_F_ONLINK as u32) != 0;

    Some(Route {
        destination: network,
        link_index,
        gateway,
        source,
        protocol: header.protocol as u8,
        table: header.table as u32,
        scope: header.scope as u8,
        onlink,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: &str, link: u32) -> Route {
        Route {
            destination: dest.parse().unwrap(),
            link_index: link,
            gateway: None,
            source: None,
            protocol: 0,
            table: 254,
            scope: 0,
            onlink: false,
        }
    }

    #[test]
    fn idempotence_of_identical_snapshot() {
        let current = vec![route("10.244.1.0/24", 3)];
        let plan = diff_routes(&current, &current, false);
        assert!(plan.is_empty());
    }

    #[test]
    fn gateway_change_triggers_update() {
        let mut current = route("10.244.1.0/24", 3);
        current.gateway = Some("10.0.0.2".parse().unwrap());
        let mut desired = current.clone();
        desired.gateway = Some("10.0.0.9".parse().unwrap());
        let plan = diff_routes(&[current], &[desired.clone()], false);
        assert_eq!(plan.update, vec![desired]);
    }
}
