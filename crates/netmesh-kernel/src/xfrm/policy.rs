use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::Result;

use super::consts::*;
use super::socket::XfrmSocket;
use super::state::{XfrmMode, XfrmProto};
use crate::diff::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XfrmDirection {
    In,
    Out,
    Fwd,
}

impl XfrmDirection {
    fn raw(self) -> u8 {
        match self {
            XfrmDirection::In => XFRM_POLICY_IN,
            XfrmDirection::Out => XFRM_POLICY_OUT,
            XfrmDirection::Fwd => XFRM_POLICY_FWD,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            XFRM_POLICY_IN => Some(XfrmDirection::In),
            XFRM_POLICY_OUT => Some(XfrmDirection::Out),
            XFRM_POLICY_FWD => Some(XfrmDirection::Fwd),
            _ => None,
        }
    }
}

/// The selector a policy matches traffic against: source/destination
/// prefix plus optional port and protocol narrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XfrmSelector {
    pub src: Ipv4Addr,
    pub src_prefix_len: u8,
    pub dst: Ipv4Addr,
    pub dst_prefix_len: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmTemplate {
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// A single xfrm policy. `index` is kernel-assigned: on a diff match
/// the current object's index is copied onto the desired one before
/// comparison, so a re-derived policy with the same selector never
/// triggers a spurious update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmPolicy {
    pub direction: XfrmDirection,
    pub selector: XfrmSelector,
    pub priority: u32,
    pub mark: Option<u32>,
    pub index: u32,
    pub templates: Vec<XfrmTemplate>,
}

type Key = (XfrmDirection, Ipv4Addr, Ipv4Addr, u16, u16, u8);

impl XfrmPolicy {
    fn key(&self) -> Key {
        (
            self.direction,
            self.selector.src,
            self.selector.dst,
            self.selector.src_port,
            self.selector.dst_port,
            self.selector.proto,
        )
    }
}

pub fn diff_policies(current: &[XfrmPolicy], desired: &[XfrmPolicy]) -> Plan<XfrmPolicy> {
    let mut by_key: HashMap<Key, &XfrmPolicy> = current.iter().map(|p| (p.key(), p)).collect();
    let mut plan = Plan::default();

    for wanted in desired {
        let key = wanted.key();
        match by_key.remove(&key) {
            Some(existing) => {
                let mut adjusted = wanted.clone();
                adjusted.index = existing.index;
                if existing != &adjusted {
                    plan.update.push(adjusted);
                }
            }
            None => plan.create.push(wanted.clone()),
        }
    }

    plan.remove.extend(by_key.into_values().cloned());
    plan
}

pub struct XfrmPolicyTable {
    socket: XfrmSocket,
}

impl XfrmPolicyTable {
    pub fn open() -> Result<Self> {
        Ok(Self {
            socket: XfrmSocket::open()?,
        })
    }

    pub async fn list(&self) -> Result<Vec<XfrmPolicy>> {
        let dumps = self.socket.dump(XFRM_MSG_GETPOLICY, &[]).await?;
        Ok(dumps.iter().filter_map(|body| decode_userpolicy_info(body)).collect())
    }

    pub async fn apply(&self, plan: &Plan<XfrmPolicy>) -> Result<()> {
        for policy in &plan.remove {
            match self.delete(policy).await {
                Ok(()) => {}
                Err(err) => tracing::debug!(error = ?err, "xfrm policy already absent"),
            }
        }
        for policy in plan.create.iter().chain(plan.update.iter()) {
            self.upsert(policy).await?;
        }
        Ok(())
    }

    async fn upsert(&self, policy: &XfrmPolicy) -> Result<()> {
        let payload = encode_userpolicy_info(policy);
        self.socket.request(XFRM_MSG_NEWPOLICY, &payload).await
    }

    async fn delete(&self, policy: &XfrmPolicy) -> Result<()> {
        let payload = encode_userpolicy_id(policy);
        self.socket.request(XFRM_MSG_DELPOLICY, &payload).await
    }

    /// Flushes every policy in the table; see [`XfrmStateTable::flush`].
    pub async fn flush(&self) -> Result<()> {
        self.socket.request(XFRM_MSG_FLUSHPOLICY, &[]).await
    }
}

// xfrm_userpolicy_info roughly: selector(56) + lft cfg(32) + lft cur(32)
// + priority(4) + index(4) + dir(1) + action(1) + flags(1) + share(1).
fn encode_userpolicy_info(policy: &XfrmPolicy) -> Vec<u8> {
    let mut buf = vec![0u8; 128];

    buf[0..4].copy_from_slice(&policy.selector.dst.octets());
    buf[16..20].copy_from_slice(&policy.selector.src.octets());
    buf[32] = policy.selector.dst_prefix_len;
    buf[33] = policy.selector.src_prefix_len;
    buf[36..38].copy_from_slice(&policy.selector.dst_port.to_be_bytes());
    buf[40..42].copy_from_slice(&policy.selector.src_port.to_be_bytes());
    buf[48] = policy.selector.proto;
    buf[50..52].copy_from_slice(&AF_INET.to_ne_bytes());

    let after_selector = 56 + 32 + 32;
    buf[after_selector..after_selector + 4].copy_from_slice(&policy.priority.to_ne_bytes());
    buf[after_selector + 4..after_selector + 8].copy_from_slice(&policy.index.to_ne_bytes());
    buf[after_selector + 8] = policy.direction.raw();
    buf[after_selector + 9] = 0; // XFRM_POLICY_ALLOW
    buf[after_selector + 11] = XFRM_SHARE_ANY;

    let mut attrs = Vec::new();
    if !policy.templates.is_empty() {
        let mut tmpl_bytes = Vec::new();
        for tmpl in &policy.templates {
            tmpl_bytes.extend(encode_template(tmpl));
        }
        attrs.extend(nla(XFRMA_TMPL, &tmpl_bytes));
    }

    buf.extend(attrs);
    buf
}

fn encode_userpolicy_id(policy: &XfrmPolicy) -> Vec<u8> {
    // xfrm_userpolicy_id: selector(56) + index(4) + dir(1) + pad(3)
    let mut buf = vec![0u8; 64];
    buf[0..4].copy_from_slice(&policy.selector.dst.octets());
    buf[16..20].copy_from_slice(&policy.selector.src.octets());
    buf[56..60].copy_from_slice(&policy.index.to_ne_bytes());
    buf[60] = policy.direction.raw();
    buf
}

// xfrm_user_tmpl: id(20: daddr16+spi4... folded) + family(2) + saddr(16)
// + reqid(4) + mode(1) + share(1) + optional(1) + pad(1) + aalgos(4)
// + ealgos(4) + calgos(4).
fn encode_template(tmpl: &XfrmTemplate) -> Vec<u8> {
    let mut buf = vec![0u8; 64];
    buf[0..4].copy_from_slice(&tmpl.dst.octets());
    buf[16] = match tmpl.proto {
        XfrmProto::Ah => IPPROTO_AH,
        XfrmProto::Esp => IPPROTO_ESP,
    };
    buf[20..22].copy_from_slice(&AF_INET.to_ne_bytes());
    buf[22..26].copy_from_slice(&tmpl.src.octets());
    buf[36] = match tmpl.mode {
        XfrmMode::Tunnel => XFRM_MODE_TUNNEL,
    };
    buf
}

/// Walks the TLV attributes following the fixed `xfrm_userpolicy_info`
/// header; see the matching walker in `state.rs`.
fn walk_attrs(body: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let len = u16::from_ne_bytes([body[offset], body[offset + 1]]) as usize;
        let attr_type = u16::from_ne_bytes([body[offset + 2], body[offset + 3]]);
        if len < 4 || offset + len > body.len() {
            break;
        }
        attrs.push((attr_type, &body[offset + 4..offset + len]));
        offset += (len + 3) & !3;
    }
    attrs
}

fn decode_template(buf: &[u8]) -> Option<XfrmTemplate> {
    if buf.len() < 40 {
        return None;
    }
    let dst = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let proto = match buf[16] {
        IPPROTO_AH => XfrmProto::Ah,
        IPPROTO_ESP => XfrmProto::Esp,
        _ => return None,
    };
    let src = Ipv4Addr::new(buf[22], buf[23], buf[24], buf[25]);
    let mode = match buf[36] {
        XFRM_MODE_TUNNEL => XfrmMode::Tunnel,
        _ => return None,
    };
    Some(XfrmTemplate { proto, mode, src, dst })
}

fn decode_userpolicy_info(body: &[u8]) -> Option<XfrmPolicy> {
    if body.len() < 128 {
        return None;
    }

    let dst = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
    let src = Ipv4Addr::new(body[16], body[17], body[18], body[19]);
    let dst_prefix_len = body[32];
    let src_prefix_len = body[33];
    let dst_port = u16::from_be_bytes(body[36..38].try_into().ok()?);
    let src_port = u16::from_be_bytes(body[40..42].try_into().ok()?);
    let proto = body[48];

    let after_selector = 56 + 32 + 32;
    let priority = u32::from_ne_bytes(body[after_selector..after_selector + 4].try_into().ok()?);
    let index = u32::from_ne_bytes(body[after_selector + 4..after_selector + 8].try_into().ok()?);
    let direction = XfrmDirection::from_raw(body[after_selector + 8])?;

    let mut templates = Vec::new();
    for (attr_type, payload) in walk_attrs(&body[128..]) {
        if attr_type == XFRMA_TMPL {
            templates.extend(payload.chunks(64).filter_map(decode_template));
        }
    }

    Some(XfrmPolicy {
        direction,
        selector: XfrmSelector {
            src,
            src_prefix_len,
            dst,
            dst_prefix_len,
            src_port,
            dst_port,
            proto,
        },
        priority,
        mark: None,
        index,
        templates,
    })
}

fn nla(attr_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    let len = 4 + payload.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(src: &str, dst: &str, dport: u16) -> XfrmSelector {
        XfrmSelector {
            src: src.parse().unwrap(),
            src_prefix_len: 32,
            dst: dst.parse().unwrap(),
            dst_prefix_len: 32,
            src_port: 0,
            dst_port: dport,
            proto: 17,
        }
    }

    fn bypass_policy(dir: XfrmDirection, index: u32) -> XfrmPolicy {
        XfrmPolicy {
            direction: dir,
            selector: selector("0.0.0.0", "0.0.0.0", 4500),
            priority: 200,
            mark: None,
            index,
            templates: vec![],
        }
    }

    #[test]
    fn index_copy_avoids_spurious_update() {
        let current = vec![bypass_policy(XfrmDirection::In, 42)];
        let desired = vec![bypass_policy(XfrmDirection::In, 0)];
        let plan = diff_policies(&current, &desired);
        assert!(plan.is_empty(), "re-derived policy with a fresh index must not be an update");
    }

    #[test]
    fn priority_change_is_an_update_with_copied_index() {
        let current = vec![bypass_policy(XfrmDirection::In, 42)];
        let mut desired = bypass_policy(XfrmDirection::In, 0);
        desired.priority = 100;
        let plan = diff_policies(&current, &[desired]);
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].index, 42);
        assert_eq!(plan.update[0].priority, 100);
    }

    #[test]
    fn leftover_current_policy_is_removed() {
        let current = vec![bypass_policy(XfrmDirection::In, 1), bypass_policy(XfrmDirection::Out, 2)];
        let desired = vec![bypass_policy(XfrmDirection::In, 0)];
        let plan = diff_policies(&current, &desired);
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(plan.remove[0].direction, XfrmDirection::Out);
    }

    #[test]
    fn decode_round_trips_bypass_policy_without_templates() {
        let policy = bypass_policy(XfrmDirection::Fwd, 7);
        let buf = encode_userpolicy_info(&policy);
        let decoded = decode_userpolicy_info(&buf).expect("decodes a freshly encoded policy");
        assert_eq!(decoded, policy);
    }

    #[test]
    fn decode_round_trips_policy_with_templates() {
        let mut policy = bypass_policy(XfrmDirection::Out, 3);
        policy.selector = selector("10.244.0.0", "10.244.1.0", 0);
        policy.templates = vec![XfrmTemplate {
            proto: XfrmProto::Esp,
            mode: XfrmMode::Tunnel,
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
        }];
        let buf = encode_userpolicy_info(&policy);
        let decoded = decode_userpolicy_info(&buf).expect("decodes a freshly encoded policy");
        assert_eq!(decoded, policy);
    }
}
