use std::net::Ipv4Addr;

use anyhow::Context;
use anyhow::Result;
use ipnetwork::Ipv4Network;
use netlink_sys::{protocols::NETLINK_ROUTE, SocketAddr, TokioSocket};
use netmesh_kernel::diff::Plan;
use netmesh_kernel::neigh::{Neigh, NeighTable, NUD_REACHABLE};

use crate::derive::map_to_mac;

const RTM_NEWNEIGH: u16 = 28;
const RTMGRP_NEIGH: u32 = 1 << 2; // RTNLGRP_NEIGH (3), bit (group - 1)
const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;
const AF_INET: u8 = 2;

/// Legacy fast path: enables ARP suppression on `device` and injects a
/// `NUD_REACHABLE` entry the moment the kernel reports an unresolved
/// neighbour on the vxlan device, instead of waiting for the next full
/// reconcile. Superseded by `VxlanProvider`'s pre-populated ARP, which
/// is the preferred configuration; kept for hosts that rely on it.
pub async fn run(
    device: &str,
    device_index: u32,
    neighs: NeighTable,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    std::fs::write(format!("/proc/sys/net/ipv4/neigh/{device}/app_solicit"), b"3")
        .with_context(|| format!("enabling ARP suppression on {device}"))?;

    let mut socket = TokioSocket::new(NETLINK_ROUTE).context("opening NETLINK_ROUTE socket")?;
    socket
        .bind(&SocketAddr::new(0, RTMGRP_NEIGH))
        .context("subscribing to RTNLGRP_NEIGH")?;

    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            _ = cancel.changed() => return Ok(()),
            result = socket.recv(&mut buf) => {
                let n = result.context("receiving neighbour notification")?;
                if let Some(entry) = parse_unresolved(&buf[..n], device_index) {
                    let plan = Plan { create: vec![entry], update: vec![], remove: vec![] };
                    if let Err(err) = neighs.apply(&plan).await {
                        tracing::warn!(error = ?err, "failed to inject resolved ARP entry, next reconcile will retry");
                    }
                }
            }
        }
    }
}

/// Looks for a notification whose state excludes `NUD_REACHABLE`,
/// whose hardware address is empty, and whose destination is IPv4 on
/// the watched link — the signal that the kernel wants an ARP entry
/// this agent can resolve deterministically from the address alone.
fn parse_unresolved(buf: &[u8], device_index: u32) -> Option<Neigh> {
    if buf.len() < 16 {
        return None;
    }
    let msg_type = u16::from_ne_bytes(buf[4..6].try_into().ok()?);
    if msg_type != RTM_NEWNEIGH {
        return None;
    }

    // ndmsg: family(1) pad(3) ifindex(4) state(2) flags(1) type(1)
    let body = &buf[16..];
    if body.len() < 12 {
        return None;
    }
    let family = body[0];
    let ifindex = u32::from_ne_bytes(body[4..8].try_into().ok()?);
    let state = u16::from_ne_bytes(body[8..10].try_into().ok()?);

    if family != AF_INET || ifindex != device_index || state & NUD_REACHABLE != 0 {
        return None;
    }

    let mut offset = 12;
    let mut dst: Option<Ipv4Addr> = None;
    let mut has_lladdr = false;
    while offset + 4 <= body.len() {
        let attr_len = u16::from_ne_bytes(body[offset..offset + 2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(body[offset + 2..offset + 4].try_into().ok()?);
        if attr_len < 4 || offset + attr_len > body.len() {
            break;
        }
        let payload = &body[offset + 4..offset + attr_len];
        match attr_type {
            NDA_DST if payload.len() == 4 => {
                dst = Some(Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]));
            }
            NDA_LLADDR if !payload.is_empty() => has_lladdr = true,
            _ => {}
        }
        offset += (attr_len + 3) & !3;
    }

    if has_lladdr {
        return None;
    }

    let ip = dst?;
    let network = Ipv4Network::new(ip, 24).ok()?.network();
    let mac = map_to_mac(network);

    Some(Neigh {
        link_index: device_index,
        ip: network,
        family: AF_INET as u16,
        state: NUD_REACHABLE,
        flags: 0,
        hardware_address: mac,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neigh_notification(ifindex: u32, state: u16, dst: [u8; 4], lladdr: Option<[u8; 6]>) -> Vec<u8> {
        let mut body = vec![0u8; 12];
        body[0] = AF_INET;
        body[4..8].copy_from_slice(&ifindex.to_ne_bytes());
        body[8..10].copy_from_slice(&state.to_ne_bytes());

        let mut dst_attr = vec![0u8; 4];
        dst_attr[0..2].copy_from_slice(&8u16.to_ne_bytes());
        dst_attr[2..4].copy_from_slice(&NDA_DST.to_ne_bytes());
        dst_attr.extend_from_slice(&dst);
        body.extend(dst_attr);

        if let Some(mac) = lladdr {
            let mut lladdr_attr = vec![0u8; 4];
            lladdr_attr[0..2].copy_from_slice(&10u16.to_ne_bytes());
            lladdr_attr[2..4].copy_from_slice(&NDA_LLADDR.to_ne_bytes());
            lladdr_attr.extend_from_slice(&mac);
            body.extend(lladdr_attr);
        }

        let mut msg = vec![0u8; 16];
        let total_len = (16 + body.len()) as u32;
        msg[0..4].copy_from_slice(&total_len.to_ne_bytes());
        msg[4..6].copy_from_slice(&RTM_NEWNEIGH.to_ne_bytes());
        msg.extend(body);
        msg
    }

    #[test]
    fn injects_entry_for_unresolved_notification() {
        let msg = neigh_notification(4, 0, [10, 244, 1, 7], None);
        let entry = parse_unresolved(&msg, 4).expect("should parse");
        assert_eq!(entry.ip, Ipv4Addr::new(10, 244, 1, 0));
        assert_eq!(entry.state, NUD_REACHABLE);
    }

    #[test]
    fn ignores_notification_with_lladdr_present() {
        let msg = neigh_notification(4, 0, [10, 244, 1, 7], Some([0, 0x53, 10, 244, 1, 0]));
        assert!(parse_unresolved(&msg, 4).is_none());
    }

    #[test]
    fn ignores_notification_already_reachable() {
        let msg = neigh_notification(4, NUD_REACHABLE, [10, 244, 1, 7], None);
        assert!(parse_unresolved(&msg, 4).is_none());
    }

    #[test]
    fn ignores_other_link_index() {
        let msg = neigh_notification(9, 0, [10, 244, 1, 7], None);
        assert!(parse_unresolved(&msg, 4).is_none());
    }
}
