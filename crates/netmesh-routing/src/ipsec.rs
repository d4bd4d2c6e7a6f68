//! IPsec backend: encrypts inter-node pod traffic with the kernel's XFRM
//! framework. Three orthogonal strategies — authentication, encryption,
//! encapsulation — are selected once at construction from config and
//! composed into the states and policies this backend pushes each
//! reconcile.

use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use netmesh_inventory::Inventory;
use netmesh_kernel::xfrm::{
    diff_policies, diff_states, XfrmAlgo, XfrmDirection, XfrmEncap, XfrmMode, XfrmPolicy,
    XfrmPolicyTable, XfrmProto, XfrmSelector, XfrmState, XfrmStateTable, XfrmTemplate,
};
use netmesh_types::{IpsecAuthentication, IpsecConfig, IpsecEncapsulation, IpsecEncryption};
use tokio::process::Command;

use crate::derive::compute_node_numeral;
use crate::derive::compute_spi;
use crate::{Provider, VersionGate};

const UDP_ENCAP_PORT: u16 = 4500;
const BYPASS_PRIORITY: u32 = 200;
const DEFAULT_PRIORITY: u32 = 0;
const PEER_PRIORITY: u32 = 100;

/// Placeholder keys, compiled in. A deliberate stand-in for real key
/// distribution (§9): kept behind the strategy trait so a real
/// key-management layer can be substituted without touching the
/// backend's state-building logic.
const FIXED_AUTH_KEY: [u8; 20] = [0x3f; 20];
const FIXED_CRYPT_KEY: [u8; 20] = [0x7a; 20];

pub trait AuthenticationStrategy: Send + Sync {
    fn use_ah(&self) -> bool;
    fn algo(&self) -> XfrmAlgo;
}

struct Sha1Authentication;
impl AuthenticationStrategy for Sha1Authentication {
    fn use_ah(&self) -> bool {
        true
    }
    fn algo(&self) -> XfrmAlgo {
        XfrmAlgo {
            name: "hmac(sha1)".into(),
            key: FIXED_AUTH_KEY.to_vec(),
        }
    }
}

struct NullAuthentication;
impl AuthenticationStrategy for NullAuthentication {
    fn use_ah(&self) -> bool {
        true
    }
    fn algo(&self) -> XfrmAlgo {
        XfrmAlgo {
            name: "digest_null".into(),
            key: Vec::new(),
        }
    }
}

pub trait EncryptionStrategy: Send + Sync {
    fn algo(&self) -> XfrmAlgo;
}

struct AesEncryption;
impl EncryptionStrategy for AesEncryption {
    fn algo(&self) -> XfrmAlgo {
        XfrmAlgo {
            name: "rfc3686(ctr(aes))".into(),
            key: FIXED_CRYPT_KEY.to_vec(),
        }
    }
}

struct NullEncryption;
impl EncryptionStrategy for NullEncryption {
    fn algo(&self) -> XfrmAlgo {
        XfrmAlgo {
            name: "ecb(cipher_null)".into(),
            key: Vec::new(),
        }
    }
}

pub trait EncapsulationStrategy: Send + Sync {
    fn encap(&self) -> Option<XfrmEncap>;
}

struct UdpEncapsulation;
impl EncapsulationStrategy for UdpEncapsulation {
    fn encap(&self) -> Option<XfrmEncap> {
        Some(XfrmEncap::EspInUdp {
            src_port: UDP_ENCAP_PORT,
            dst_port: UDP_ENCAP_PORT,
        })
    }
}

struct PlainEspEncapsulation;
impl EncapsulationStrategy for PlainEspEncapsulation {
    fn encap(&self) -> Option<XfrmEncap> {
        None
    }
}

fn authentication_strategy(choice: IpsecAuthentication) -> Box<dyn AuthenticationStrategy> {
    match choice {
        IpsecAuthentication::Sha1 => Box::new(Sha1Authentication),
        IpsecAuthentication::None => Box::new(NullAuthentication),
    }
}

fn encryption_strategy(choice: IpsecEncryption) -> Box<dyn EncryptionStrategy> {
    match choice {
        IpsecEncryption::Aes => Box::new(AesEncryption),
        IpsecEncryption::None => Box::new(NullEncryption),
    }
}

fn encapsulation_strategy(choice: IpsecEncapsulation) -> Box<dyn EncapsulationStrategy> {
    match choice {
        IpsecEncapsulation::Udp => Box::new(UdpEncapsulation),
        IpsecEncapsulation::Esp => Box::new(PlainEspEncapsulation),
    }
}

/// Probes the kernel modules the backend relies on. A missing module
/// usually means the feature still works (built statically into the
/// kernel); failures are logged, not fatal, since `modprobe` itself may
/// be absent in a minimal container image.
async fn probe_modules() {
    for module in ["af_key", "ah4", "ipcomp", "xfrm4_tunnel"] {
        match Command::new("modprobe").arg(module).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::debug!(module, code = ?status.code(), "modprobe exited non-zero"),
            Err(err) => tracing::debug!(module, error = ?err, "modprobe unavailable"),
        }
    }
}

/// Opens the UDP/4500 socket the kernel uses to decapsulate ESP-in-UDP
/// packets out of band, with `UDP_ENCAP=ESPINUDP` and bypass IPsec
/// policy in both directions so the encapsulated traffic itself isn't
/// re-encrypted by the socket's own policy lookup.
fn open_encap_socket() -> Result<UdpSocket> {
    const SOL_UDP: libc::c_int = 17;
    const UDP_ENCAP: libc::c_int = 100;
    const UDP_ENCAP_ESPINUDP: libc::c_int = 2;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, UDP_ENCAP_PORT))
        .with_context(|| format!("binding ESP-in-UDP socket on port {UDP_ENCAP_PORT}"))?;

    let value: libc::c_int = UDP_ENCAP_ESPINUDP;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_UDP,
            UDP_ENCAP,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setting UDP_ENCAP=ESPINUDP");
    }

    set_bypass_policy(&socket, Direction::In)?;
    set_bypass_policy(&socket, Direction::Out)?;
    Ok(socket)
}

enum Direction {
    In,
    Out,
}

/// `setsockopt(IP_IPSEC_POLICY, bypass)`, hand-encoded the same way
/// `netmesh_kernel::xfrm` hand-encodes its netlink messages: no crate
/// in the dependency graph models the kernel's `struct xfrm_userpolicy_info`
/// socket-option payload.
fn set_bypass_policy(socket: &UdpSocket, dir: Direction) -> Result<()> {
    const SOL_IP: libc::c_int = 0;
    const IP_IPSEC_POLICY: libc::c_int = 16;
    const IPSEC_POLICY_BYPASS: u8 = 2;

    // sa_family(4) + len(4) + dir(1) + policy(1) + pad(2)
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&(libc::AF_INET as u32).to_ne_bytes());
    buf[8] = match dir {
        Direction::In => 0,
        Direction::Out => 1,
    };
    buf[9] = IPSEC_POLICY_BYPASS;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_IP,
            IP_IPSEC_POLICY,
            buf.as_ptr() as *const libc::c_void,
            buf.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("setting IP_IPSEC_POLICY bypass");
    }
    Ok(())
}

pub struct IpsecProvider {
    states: XfrmStateTable,
    policies: XfrmPolicyTable,
    authentication: Box<dyn AuthenticationStrategy>,
    encryption: Box<dyn EncryptionStrategy>,
    encapsulation: Box<dyn EncapsulationStrategy>,
    _encap_socket: Option<UdpSocket>,
    version_gate: VersionGate,
}

impl IpsecProvider {
    /// `flush_on_start` is a deliberate reset for state-desynchronization
    /// recovery (§4.8); callers wire it to a one-shot flag so it only
    /// ever fires on the very first reconcile of a process's lifetime.
    pub async fn new(config: &IpsecConfig, flush_on_start: bool) -> Result<Self> {
        probe_modules().await;

        let states = XfrmStateTable::open().context("opening NETLINK_XFRM state socket")?;
        let policies = XfrmPolicyTable::open().context("opening NETLINK_XFRM policy socket")?;

        if flush_on_start {
            states.flush().await.context("flushing xfrm state table")?;
            policies.flush().await.context("flushing xfrm policy table")?;
        }

        let encap_socket = match config.encapsulation {
            IpsecEncapsulation::Udp => {
                Some(open_encap_socket().context("opening ESP-in-UDP socket")?)
            }
            IpsecEncapsulation::Esp => None,
        };

        Ok(Self {
            states,
            policies,
            authentication: authentication_strategy(config.authentication),
            encryption: encryption_strategy(config.encryption),
            encapsulation: encapsulation_strategy(config.encapsulation),
            _encap_socket: encap_socket,
            version_gate: VersionGate::new(),
        })
    }

    fn desired_states(&self, self_underlay: Ipv4Addr, self_numeral: u16, peer_underlay: Ipv4Addr, peer_numeral: u16) -> Vec<XfrmState> {
        build_desired_states(
            self.authentication.as_ref(),
            self.encryption.as_ref(),
            self.encapsulation.as_ref(),
            self_underlay,
            self_numeral,
            peer_underlay,
            peer_numeral,
        )
    }

    fn bypass_and_default_policies(&self) -> Vec<XfrmPolicy> {
        build_bypass_and_default_policies()
    }

    fn peer_policies(&self, self_underlay: Ipv4Addr, self_cidr: Ipv4Network, peer_underlay: Ipv4Addr, peer_cidr: Ipv4Network) -> Vec<XfrmPolicy> {
        build_peer_policies(self_underlay, self_cidr, peer_underlay, peer_cidr)
    }
}

fn build_desired_states(
    authentication: &dyn AuthenticationStrategy,
    encryption: &dyn EncryptionStrategy,
    encapsulation: &dyn EncapsulationStrategy,
    self_underlay: Ipv4Addr,
    self_numeral: u16,
    peer_underlay: Ipv4Addr,
    peer_numeral: u16,
) -> Vec<XfrmState> {
    let mut states = Vec::with_capacity(4);

    let outbound_esp_spi = compute_spi(self_numeral, peer_numeral, 1);
    let inbound_esp_spi = compute_spi(peer_numeral, self_numeral, 1);

    if authentication.use_ah() {
        let outbound_ah_spi = compute_spi(self_numeral, peer_numeral, 0);
        let inbound_ah_spi = compute_spi(peer_numeral, self_numeral, 0);
        states.push(XfrmState {
            spi: outbound_ah_spi,
            proto: XfrmProto::Ah,
            mode: XfrmMode::Tunnel,
            src: self_underlay,
            dst: peer_underlay,
            auth: Some(authentication.algo()),
            crypt: None,
            encap: None,
        });
        states.push(XfrmState {
            spi: inbound_ah_spi,
            proto: XfrmProto::Ah,
            mode: XfrmMode::Tunnel,
            src: peer_underlay,
            dst: self_underlay,
            auth: Some(authentication.algo()),
            crypt: None,
            encap: None,
        });
    }

    states.push(XfrmState {
        spi: outbound_esp_spi,
        proto: XfrmProto::Esp,
        mode: XfrmMode::Tunnel,
        src: self_underlay,
        dst: peer_underlay,
        auth: None,
        crypt: Some(encryption.algo()),
        encap: encapsulation.encap(),
    });
    states.push(XfrmState {
        spi: inbound_esp_spi,
        proto: XfrmProto::Esp,
        mode: XfrmMode::Tunnel,
        src: peer_underlay,
        dst: self_underlay,
        auth: None,
        crypt: Some(encryption.algo()),
        encap: encapsulation.encap(),
    });

    states
}

fn build_bypass_and_default_policies() -> Vec<XfrmPolicy> {
    let wildcard = XfrmSelector {
        src: Ipv4Addr::UNSPECIFIED,
        src_prefix_len: 0,
        dst: Ipv4Addr::UNSPECIFIED,
        dst_prefix_len: 0,
        src_port: 0,
        dst_port: 0,
        proto: 0,
    };
    let udp_dst_4500 = XfrmSelector {
        dst_port: UDP_ENCAP_PORT,
        proto: libc::IPPROTO_UDP as u8,
        ..wildcard
    };

    let mut policies = Vec::with_capacity(5);
    for dir in [XfrmDirection::In, XfrmDirection::Out, XfrmDirection::Fwd] {
        policies.push(XfrmPolicy {
            direction: dir,
            selector: udp_dst_4500,
            priority: BYPASS_PRIORITY,
            mark: None,
            index: 0,
            templates: vec![],
        });
    }
    for dir in [XfrmDirection::In, XfrmDirection::Out] {
        policies.push(XfrmPolicy {
            direction: dir,
            selector: wildcard,
            priority: DEFAULT_PRIORITY,
            mark: None,
            index: 0,
            templates: vec![],
        });
    }
    policies
}

/// Nine policies per remote node: three directions times three
/// source/destination scope pairs, each carrying one ESP tunnel
/// template between the two nodes' underlay addresses.
fn build_peer_policies(self_underlay: Ipv4Addr, self_cidr: Ipv4Network, peer_underlay: Ipv4Addr, peer_cidr: Ipv4Network) -> Vec<XfrmPolicy> {
    let self_pod = (self_cidr.ip(), self_cidr.prefix());
    let peer_pod = (peer_cidr.ip(), peer_cidr.prefix());

    let mut policies = Vec::with_capacity(9);
    for dir in [XfrmDirection::In, XfrmDirection::Out, XfrmDirection::Fwd] {
        // Out templates encrypt from self to the peer; In and Fwd carry
        // traffic arriving already encrypted from the peer.
        let (tmpl_src, tmpl_dst) = match dir {
            XfrmDirection::Out => (self_underlay, peer_underlay),
            XfrmDirection::In | XfrmDirection::Fwd => (peer_underlay, self_underlay),
        };
        let template = XfrmTemplate {
            proto: XfrmProto::Esp,
            mode: XfrmMode::Tunnel,
            src: tmpl_src,
            dst: tmpl_dst,
        };

        // pod-to-pod, pod-to-underlay and underlay-to-pod: traffic
        // destined to or originating from the peer's host itself also
        // needs to traverse the tunnel, not just pod-subnet traffic.
        let scope_pairs: [((Ipv4Addr, u8), (Ipv4Addr, u8)); 3] = match dir {
            XfrmDirection::Out => [
                (self_pod, peer_pod),
                (self_pod, (peer_underlay, 32)),
                ((self_underlay, 32), peer_pod),
            ],
            XfrmDirection::In | XfrmDirection::Fwd => [
                (peer_pod, self_pod),
                (peer_pod, (self_underlay, 32)),
                ((peer_underlay, 32), self_pod),
            ],
        };

        for (src, dst) in scope_pairs {
            policies.push(XfrmPolicy {
                direction: dir,
                selector: XfrmSelector {
                    src: src.0,
                    src_prefix_len: src.1,
                    dst: dst.0,
                    dst_prefix_len: dst.1,
                    src_port: 0,
                    dst_port: 0,
                    proto: 0,
                },
                priority: PEER_PRIORITY,
                mark: None,
                index: 0,
                templates: vec![template.clone()],
            });
        }
    }
    policies
}

#[async_trait]
impl Provider for IpsecProvider {
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
            .ok_or_else(|| anyhow::anyhow!("self node {} has no pod CIDR", self_node.name))?;
        let self_underlay = self_node
            .underlay_address
            .ok_or_else(|| anyhow::anyhow!("self node {} has no underlay address", self_node.name))?;
        let self_numeral = compute_node_numeral(self_cidr);

        let peers: Vec<_> = snapshot
            .nodes
            .values()
            .filter(|n| n.name != self_node.name)
            .filter_map(|n| Some((n.pod_cidr?, n.underlay_address?)))
            .collect();

        let mut desired_states = Vec::new();
        let mut desired_policies = self.bypass_and_default_policies();

        for (peer_cidr, peer_underlay) in &peers {
            let peer_numeral = compute_node_numeral(*peer_cidr);
            desired_states.extend(self.desired_states(self_underlay, self_numeral, *peer_underlay, peer_numeral));
            desired_policies.extend(self.peer_policies(self_underlay, self_cidr, *peer_underlay, *peer_cidr));
        }

        let current_states = self.states.list().await.context("listing xfrm states")?;
        let state_plan = diff_states(&current_states, &desired_states);
        self.states.apply(&state_plan).await.context("applying xfrm state plan")?;

        let current_policies = self.policies.list().await.context("listing xfrm policies")?;
        let policy_plan = diff_policies(&current_policies, &desired_policies);
        self.policies.apply(&policy_plan).await.context("applying xfrm policy plan")?;

        self.version_gate.record(snapshot.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmesh_types::IpsecAuthentication as Auth;
    use netmesh_types::IpsecEncryption as Enc;

    fn provider_with_strategies(auth: Auth, enc: Enc) -> (Box<dyn AuthenticationStrategy>, Box<dyn EncryptionStrategy>) {
        (authentication_strategy(auth), encryption_strategy(enc))
    }

    #[test]
    fn sha1_authentication_requests_ah() {
        let (auth, _) = provider_with_strategies(Auth::Sha1, Enc::Aes);
        assert!(auth.use_ah());
        assert_eq!(auth.algo().name, "hmac(sha1)");
        assert_eq!(auth.algo().key.len(), 20);
    }

    #[test]
    fn null_authentication_still_carries_ah_with_no_mac() {
        let (auth, _) = provider_with_strategies(Auth::None, Enc::Aes);
        assert!(auth.use_ah());
        assert_eq!(auth.algo().name, "digest_null");
        assert!(auth.algo().key.is_empty());
    }

    #[test]
    fn encryption_strategies_always_produce_esp_algo() {
        let aes = encryption_strategy(Enc::Aes);
        assert_eq!(aes.algo().name, "rfc3686(ctr(aes))");
        assert_eq!(aes.algo().key.len(), 20);
        let none = encryption_strategy(Enc::None);
        assert_eq!(none.algo().name, "ecb(cipher_null)");
    }

    #[test]
    fn udp_encapsulation_targets_port_4500() {
        let udp = encapsulation_strategy(IpsecEncapsulation::Udp);
        match udp.encap() {
            Some(XfrmEncap::EspInUdp { src_port, dst_port }) => {
                assert_eq!(src_port, UDP_ENCAP_PORT);
                assert_eq!(dst_port, UDP_ENCAP_PORT);
            }
            None => panic!("udp encapsulation strategy must request EspInUdp"),
        }
        assert!(encapsulation_strategy(IpsecEncapsulation::Esp).encap().is_none());
    }

    #[test]
    fn peer_policy_count_matches_nine_per_remote() {
        let self_underlay: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let peer_underlay: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let self_cidr: Ipv4Network = "10.244.0.0/24".parse().unwrap();
        let peer_cidr: Ipv4Network = "10.244.1.0/24".parse().unwrap();
        let policies = build_peer_policies(self_underlay, self_cidr, peer_underlay, peer_cidr);
        assert_eq!(policies.len(), 9);
        assert!(policies.iter().all(|p| p.priority == PEER_PRIORITY));
    }

    #[test]
    fn bypass_and_default_policy_count() {
        let policies = build_bypass_and_default_policies();
        assert_eq!(policies.iter().filter(|p| p.priority == BYPASS_PRIORITY).count(), 3);
        assert_eq!(policies.iter().filter(|p| p.priority == DEFAULT_PRIORITY).count(), 2);
    }

    #[test]
    fn desired_states_include_ah_when_strategy_requires_it() {
        let authentication = authentication_strategy(Auth::Sha1);
        let encryption = encryption_strategy(Enc::Aes);
        let encapsulation = encapsulation_strategy(IpsecEncapsulation::Udp);
        let states = build_desired_states(
            authentication.as_ref(),
            encryption.as_ref(),
            encapsulation.as_ref(),
            "10.0.0.1".parse().unwrap(),
            0,
            "10.0.0.2".parse().unwrap(),
            1,
        );
        assert_eq!(states.len(), 4);
        assert_eq!(states.iter().filter(|s| s.proto == XfrmProto::Ah).count(), 2);
        assert_eq!(states.iter().filter(|s| s.proto == XfrmProto::Esp).count(), 2);
    }

    #[test]
    fn desired_states_drop_encap_when_plain_esp_is_selected() {
        // NullAuthentication still returns true from use_ah() (AH with
        // digest_null), so disabling authentication only drops the MAC,
        // not the AH states themselves.
        let authentication = authentication_strategy(Auth::None);
        let encryption = encryption_strategy(Enc::None);
        let encapsulation = encapsulation_strategy(IpsecEncapsulation::Esp);
        let states = build_desired_states(
            authentication.as_ref(),
            encryption.as_ref(),
            encapsulation.as_ref(),
            "10.0.0.1".parse().unwrap(),
            0,
            "10.0.0.2".parse().unwrap(),
            1,
        );
        assert_eq!(states.len(), 4);
        assert!(states.iter().all(|s| s.encap.is_none()));
    }
}
