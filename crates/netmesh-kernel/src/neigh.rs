use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use rtnetlink::Handle;

use crate::diff::{self, Plan};

pub const NUD_PERMANENT: u16 = 0x80;
pub const NUD_REACHABLE: u16 = 0x02;
pub const NTF_SELF: u8 = 0x02;

/// A neighbor-table entry: an ARP entry (family `AF_INET`) on the
/// overlay device, or an FDB entry (family `AF_BRIDGE`, `NTF_SELF`)
/// mapping a peer's underlay address to its mapped MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neigh {
    pub link_index: u32,
    pub ip: Ipv4Addr,
    pub family: u16,
    pub state: u16,
    pub flags: u8,
    pub hardware_address: [u8; 6],
}

impl Neigh {
    fn key(&self) -> (u32, Ipv4Addr) {
        (self.link_index, self.ip)
    }
}

/// Neighbor entries are never removed: kernel aging makes deletion
/// untrustworthy, and a stale entry for a reused mapping is harmless.
pub fn diff_neighs(current: &[Neigh], desired: &[Neigh]) -> Plan<Neigh> {
    diff::diff(current, desired, false, Neigh::key, |a, b| a == b)
}

pub struct NeighTable {
    handle: Handle,
}

impl NeighTable {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub async fn list(&self, link_index: u32, family: u16) -> Result<Vec<Neigh>> {
        let mut neighs = Vec::new();
        let mut stream = self
            .handle
            .neighbours()
            .get()
            .set_family(family)
            .execute();
        while let Some(msg) = stream.try_next().await.context("listing neighbours")? {
            if msg.header.ifindex == link_index {
                if let Some(neigh) = parse_neigh(&msg, family) {
                    neighs.push(neigh);
                }
            }
        }
        Ok(neighs)
    }

    pub async fn apply(&self, plan: &Plan<Neigh>) -> Result<()> {
        debug_assert!(plan.remove.is_empty(), "neighbor adapter never removes");
        for neigh in plan.create.iter().chain(plan.update.iter()) {
            self.upsert(neigh).await?;
        }
        Ok(())
    }

    async fn upsert(&self, neigh: &Neigh) -> Result<()> {
        self.handle
            .neighbours()
            .add(neigh.link_index, neigh.ip.into())
            .link_local_address(&neigh.hardware_address)
            .state(neigh.state)
            .flags(neigh.flags)
            .replace()
            .execute()
            .await
            .with_context(|| format!("upserting neighbour {}", neigh.ip))
    }
}

fn parse_neigh(msg: &NeighbourMessage, family: u16) -> Option<Neigh> {
    let mut ip = None;
    let mut hardware_address = [0u8; 6];

    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                ip = Some(*addr);
            }
            NeighbourAttribute::LinkLocalAddress(addr) if addr.len() == 6 => {
                hardware_address.copy_from_slice(addr);
            }
            _ => {}
        }
    }

    Some(Neigh {
        link_index: msg.header.ifindex,
        ip: ip?,
        family,
        state: msg.header.state.bits(),
        flags: msg.header.flags.bits(),
        hardware_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neigh(ip: &str, mac: [u8; 6]) -> Neigh {
        Neigh {
            link_index: 4,
            ip: ip.parse().unwrap(),
            family: 2,
            state: NUD_PERMANENT,
            flags: 0,
            hardware_address: mac,
        }
    }

    #[test]
    fn never_emits_removals() {
        let current = vec![neigh("10.244.1.0", [0, 0x53, 0x0a, 0xf4, 0x01, 0x00])];
        let desired: Vec<Neigh> = vec![];
        let plan = diff_neighs(&current, &desired);
        assert!(plan.remove.is_empty());
        assert!(plan.create.is_empty());
        assert!(plan.update.is_empty());
    }

    #[test]
    fn mac_change_triggers_update() {
        let current = neigh("10.244.1.0", [0, 0x53, 0x0a, 0xf4, 0x01, 0x00]);
        let mut desired = current.clone();
        desired.hardware_address = [0, 0x53, 0x0a, 0xf4, 0x01, 0x01];
        let plan = diff_neighs(&[current], &[desired.clone()]);
        assert_eq!(plan.update, vec![desired]);
    }
}
