use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Context, Result};
use netlink_sys::{protocols::NETLINK_XFRM, AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket};

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_DUMP: u16 = 0x0100 | 0x0200; // NLM_F_ROOT | NLM_F_MATCH

/// A `NETLINK_XFRM` socket, one per `XfrmStateTable`/`XfrmPolicyTable`.
pub struct XfrmSocket {
    socket: TokioSocket,
    seq: AtomicU32,
}

impl XfrmSocket {
    pub fn open() -> Result<Self> {
        let mut socket = TokioSocket::new(NETLINK_XFRM).context("opening NETLINK_XFRM socket")?;
        socket.bind_auto().context("binding NETLINK_XFRM socket")?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .context("connecting NETLINK_XFRM socket to the kernel")?;
        Ok(Self {
            socket,
            seq: AtomicU32::new(1),
        })
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn frame(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + payload.len());
        let len = 16 + payload.len();
        buf.extend_from_slice(&(len as u32).to_ne_bytes());
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    /// Sends a request and waits for the kernel's ack, treating a
    /// nonzero error code as a failure. Used for NEWSA/DELSA/NEWPOLICY/
    /// DELPOLICY/FLUSHSA/FLUSHPOLICY.
    pub async fn request(&self, msg_type: u16, payload: &[u8]) -> Result<()> {
        let seq = self.next_seq();
        let frame = Self::frame(msg_type, NLM_F_REQUEST | NLM_F_ACK, seq, payload);
        self.socket.send(&frame).await.context("sending xfrm netlink request")?;

        let mut buf = vec![0u8; 8192];
        let n = self.socket.recv(&mut buf).await.context("receiving xfrm netlink ack")?;
        let (header, body) = parse_header(&buf[..n])?;
        if header.msg_type != NLMSG_ERROR {
            bail!("expected NLMSG_ERROR ack, got type {}", header.msg_type);
        }
        let errno = i32::from_ne_bytes(body[0..4].try_into().unwrap());
        if errno != 0 {
            bail!("xfrm netlink request failed: errno {}", -errno);
        }
        Ok(())
    }

    /// Sends a dump (GETSA/GETPOLICY) request and collects every
    /// `NEWSA`/`NEWPOLICY` payload until `NLMSG_DONE`.
    pub async fn dump(&self, msg_type: u16, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let seq = self.next_seq();
        let frame = Self::frame(msg_type, NLM_F_REQUEST | NLM_F_DUMP, seq, payload);
        self.socket.send(&frame).await.context("sending xfrm netlink dump request")?;

        let mut items = Vec::new();
        let mut buf = vec![0u8; 32768];
        loop {
            let n = self.socket.recv(&mut buf).await.context("receiving xfrm netlink dump")?;
            let mut offset = 0;
            loop {
                if offset >= n {
                    break;
                }
                let (header, body) = parse_header(&buf[offset..n])?;
                offset += align4(header.len as usize);
                if header.msg_type == NLMSG_DONE {
                    return Ok(items);
                }
                if header.msg_type == NLMSG_ERROR {
                    let errno = i32::from_ne_bytes(body[0..4].try_into().unwrap());
                    if errno != 0 {
                        bail!("xfrm netlink dump failed: errno {}", -errno);
                    }
                    continue;
                }
                items.push(body.to_vec());
            }
        }
    }
}

struct Header {
    len: u32,
    msg_type: u16,
}

fn parse_header(buf: &[u8]) -> Result<(Header, &[u8])> {
    if buf.len() < 16 {
        bail!("short netlink message: {} bytes", buf.len());
    }
    let len = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let msg_type = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
    let body_end = (len as usize).min(buf.len());
    Ok((Header { len, msg_type }, &buf[16..body_end]))
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}
