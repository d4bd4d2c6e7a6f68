use std::net::Ipv4Addr;

use anyhow::Result;

use super::consts::*;
use super::socket::XfrmSocket;
use crate::diff::{self, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XfrmProto {
    Ah,
    Esp,
}

impl XfrmProto {
    fn ipproto(self) -> u8 {
        match self {
            XfrmProto::Ah => IPPROTO_AH,
            XfrmProto::Esp => IPPROTO_ESP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XfrmMode {
    Tunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmAlgo {
    pub name: String,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XfrmEncap {
    EspInUdp { src_port: u16, dst_port: u16 },
}

/// A single xfrm_usersa_info, keyed for diffing by its SPI. `mode` is
/// always tunnel per the backend's design; kept as a field so the
/// equality comparison is exhaustive and self-documenting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmState {
    pub spi: u32,
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub auth: Option<XfrmAlgo>,
    pub crypt: Option<XfrmAlgo>,
    pub encap: Option<XfrmEncap>,
}

impl XfrmState {
    fn key(&self) -> u32 {
        self.spi
    }
}

pub fn diff_states(current: &[XfrmState], desired: &[XfrmState]) -> Plan<XfrmState> {
    diff::diff(current, desired, true, XfrmState::key, |a, b| a == b)
}

pub struct XfrmStateTable {
    socket: XfrmSocket,
}

impl XfrmStateTable {
    pub fn open() -> Result<Self> {
        Ok(Self {
            socket: XfrmSocket::open()?,
        })
    }

    pub async fn list(&self) -> Result<Vec<XfrmState>> {
        let dumps = self.socket.dump(XFRM_MSG_GETSA, &[]).await?;
        Ok(dumps.iter().filter_map(|body| decode_usersa_info(body)).collect())
    }

    pub async fn apply(&self, plan: &Plan<XfrmState>) -> Result<()> {
        for state in &plan.remove {
            match self.delete(state).await {
                Ok(()) => {}
                // the object already vanished; a kernel delete of a
                // missing xfrm state is treated as a no-op, not an error
                Err(err) => tracing::debug!(spi = format!("{:#x}", state.spi), error = ?err, "xfrm state already absent"),
            }
        }
        for state in plan.create.iter().chain(plan.update.iter()) {
            self.upsert(state).await?;
        }
        Ok(())
    }

    async fn upsert(&self, state: &XfrmState) -> Result<()> {
        let payload = encode_usersa_info(state);
        self.socket.request(XFRM_MSG_NEWSA, &payload).await
    }

    async fn delete(&self, state: &XfrmState) -> Result<()> {
        let payload = encode_userspi_info(state);
        self.socket.request(XFRM_MSG_DELSA, &payload).await
    }

    /// Flushes every state in the table. Used once, on request, for
    /// desync recovery when the backend starts; `proto = 0` matches
    /// states of every protocol.
    pub async fn flush(&self) -> Result<()> {
        let payload = vec![0u8; 4];
        self.socket.request(XFRM_MSG_FLUSHSA, &payload).await
    }
}

// xfrm_usersa_info roughly: selector(56) + id(20) + saddr(4, v4) +
// lft cfg(32) + lft cur(32) + stats(12) + seq(4) + reqid(4) + family(2)
// + mode(1) + replay_window(1) + flags(1) + pad(3); followed by TLV
// attributes (XFRMA_ALG_AUTH / XFRMA_ALG_CRYPT / XFRMA_ENCAP).
fn encode_usersa_info(state: &XfrmState) -> Vec<u8> {
    let mut buf = vec![0u8; 184];

    // selector: match-all within the tunnel, family set so the kernel
    // accepts the message; real traffic selection is carried by the
    // policy templates, not the state's own selector.
    buf[36..38].copy_from_slice(&AF_INET.to_ne_bytes());

    // id: daddr (v4 in the first 4 bytes of the 16-byte xfrm_addr_t)
    buf[56..60].copy_from_slice(&state.dst.octets());
    buf[72..76].copy_from_slice(&u32::to_be_bytes(state.spi));
    buf[76] = state.proto.ipproto();

    // saddr
    buf[80..84].copy_from_slice(&state.src.octets());

    let family_off = 80 + 4 + 32 + 32 + 12 + 4 + 4; // saddr + lft cfg + lft cur + stats + seq + reqid
    buf[family_off..family_off + 2].copy_from_slice(&AF_INET.to_ne_bytes());
    buf[family_off + 2] = match state.mode {
        XfrmMode::Tunnel => XFRM_MODE_TUNNEL,
    };

    let mut attrs = Vec::new();
    if let Some(auth) = &state.auth {
        attrs.extend(encode_algo_attr(XFRMA_ALG_AUTH, auth));
    }
    if let Some(crypt) = &state.crypt {
        attrs.extend(encode_algo_attr(XFRMA_ALG_CRYPT, crypt));
    }
    if let Some(XfrmEncap::EspInUdp { src_port, dst_port }) = &state.encap {
        let mut encap = Vec::new();
        encap.extend_from_slice(&1u16.to_ne_bytes()); // XFRM_ENCAP_ESPINUDP
        encap.extend_from_slice(&src_port.to_ne_bytes());
        encap.extend_from_slice(&dst_port.to_ne_bytes());
        encap.extend_from_slice(&[0u8; 16]); // encap_oa, unused for this mode
        attrs.extend(nla(XFRMA_ENCAP, &encap));
    }

    buf.extend(attrs);
    buf
}

fn encode_userspi_info(state: &XfrmState) -> Vec<u8> {
    // xfrm_usersa_id: daddr(16) + spi(4) + family(2) + proto(1) + pad(1)
    let mut buf = vec![0u8; 24];
    buf[0..4].copy_from_slice(&state.dst.octets());
    buf[16..20].copy_from_slice(&u32::to_be_bytes(state.spi));
    buf[20..22].copy_from_slice(&AF_INET.to_ne_bytes());
    buf[22] = state.proto.ipproto();
    buf
}

fn encode_algo_attr(attr_type: u16, algo: &XfrmAlgo) -> Vec<u8> {
    // xfrm_algo: name[64] + key_len(bits, u32) + key bytes
    let mut payload = vec![0u8; 64 + 4];
    let name_bytes = algo.name.as_bytes();
    payload[..name_bytes.len().min(64)].copy_from_slice(&name_bytes[..name_bytes.len().min(64)]);
    payload[64..68].copy_from_slice(&((algo.key.len() * 8) as u32).to_ne_bytes());
    payload.extend_from_slice(&algo.key);
    nla(attr_type, &payload)
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

/// Walks the TLV attributes following the fixed `xfrm_usersa_info`
/// header, yielding `(attr_type, payload)` pairs. Mirrors `nla`'s
/// encoding: each attribute is `len(u16 ne)` (header-inclusive) +
/// `type(u16 ne)` + payload, padded to a 4-byte boundary.
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

fn decode_algo(payload: &[u8]) -> Option<XfrmAlgo> {
    if payload.len() < 68 {
        return None;
    }
    let name_end = payload[..64].iter().position(|&b| b == 0).unwrap_or(64);
    let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
    let key_bits = u32::from_ne_bytes(payload[64..68].try_into().ok()?);
    let key_len = (key_bits / 8) as usize;
    let key = payload.get(68..68 + key_len)?.to_vec();
    Some(XfrmAlgo { name, key })
}

fn decode_usersa_info(body: &[u8]) -> Option<XfrmState> {
    if body.len() < 184 {
        return None;
    }

    let dst = Ipv4Addr::new(body[56], body[57], body[58], body[59]);
    let spi = u32::from_be_bytes(body[72..76].try_into().ok()?);
    let proto = match body[76] {
        IPPROTO_AH => XfrmProto::Ah,
        IPPROTO_ESP => XfrmProto::Esp,
        _ => return None,
    };
    let src = Ipv4Addr::new(body[80], body[81], body[82], body[83]);

    let family_off = 80 + 4 + 32 + 32 + 12 + 4 + 4;
    let mode = match body[family_off + 2] {
        XFRM_MODE_TUNNEL => XfrmMode::Tunnel,
        _ => return None,
    };

    let mut auth = None;
    let mut crypt = None;
    let mut encap = None;
    for (attr_type, payload) in walk_attrs(&body[184..]) {
        match attr_type {
            XFRMA_ALG_AUTH => auth = decode_algo(payload),
            XFRMA_ALG_CRYPT => crypt = decode_algo(payload),
            XFRMA_ENCAP if payload.len() >= 22 => {
                let src_port = u16::from_ne_bytes(payload[2..4].try_into().ok()?);
                let dst_port = u16::from_ne_bytes(payload[4..6].try_into().ok()?);
                encap = Some(XfrmEncap::EspInUdp { src_port, dst_port });
            }
            _ => {}
        }
    }

    Some(XfrmState {
        spi,
        proto,
        mode,
        src,
        dst,
        auth,
        crypt,
        encap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esp_state(spi: u32) -> XfrmState {
        XfrmState {
            spi,
            proto: XfrmProto::Esp,
            mode: XfrmMode::Tunnel,
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            auth: None,
            crypt: Some(XfrmAlgo {
                name: "rfc3686(ctr(aes))".into(),
                key: vec![0u8; 20],
            }),
            encap: None,
        }
    }

    #[test]
    fn idempotent_on_identical_snapshot() {
        let states = vec![esp_state(0xC0000001)];
        let plan = diff_states(&states, &states);
        assert!(plan.is_empty());
    }

    #[test]
    fn key_change_creates_and_removes() {
        let current = vec![esp_state(0xC0000001)];
        let desired = vec![esp_state(0xC0010001)];
        let plan = diff_states(&current, &desired);
        assert_eq!(plan.create, vec![esp_state(0xC0010001)]);
        assert_eq!(plan.remove, vec![esp_state(0xC0000001)]);
    }

    #[test]
    fn encodes_spi_big_endian_in_id() {
        let state = esp_state(0xC0000001);
        let buf = encode_usersa_info(&state);
        assert_eq!(&buf[72..76], &0xC0000001u32.to_be_bytes());
    }

    #[test]
    fn decode_round_trips_through_encode() {
        let state = esp_state(0xC0000001);
        let buf = encode_usersa_info(&state);
        let decoded = decode_usersa_info(&buf).expect("decodes a freshly encoded state");
        assert_eq!(decoded, state);
    }

    #[test]
    fn decode_round_trips_auth_and_encap() {
        let state = XfrmState {
            spi: 0xC0010001,
            proto: XfrmProto::Ah,
            mode: XfrmMode::Tunnel,
            src: "10.0.0.2".parse().unwrap(),
            dst: "10.0.0.1".parse().unwrap(),
            auth: Some(XfrmAlgo {
                name: "hmac(sha1)".into(),
                key: vec![0x3f; 20],
            }),
            crypt: None,
            encap: Some(XfrmEncap::EspInUdp {
                src_port: 4500,
                dst_port: 4500,
            }),
        };
        let buf = encode_usersa_info(&state);
        let decoded = decode_usersa_info(&buf).expect("decodes a freshly encoded state");
        assert_eq!(decoded, state);
    }
}
