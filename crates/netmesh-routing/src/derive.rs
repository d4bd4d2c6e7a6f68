use anyhow::{bail, Result};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// `00:53` fixed, then the four octets of `ip`. Used both for the
/// VXLAN device's own hardware address and for ARP/FDB entries
/// pointing at remote pod CIDRs.
pub fn map_to_mac(ip: Ipv4Addr) -> [u8; 6] {
    let o = ip.octets();
    [0x00, 0x53, o[0], o[1], o[2], o[3]]
}

/// The 14-bit projection of a pod CIDR used to compose IPsec SPIs:
/// the network address shifted right by `32 - prefix_len` bits,
/// masked to 14 bits.
pub fn compute_node_numeral(cidr: Ipv4Network) -> u16 {
    let network: u32 = cidr.network().into();
    let shift = 32u32.saturating_sub(cidr.prefix() as u32);
    let shifted = network.checked_shr(shift).unwrap_or(0);
    (shifted & 0x3FFF) as u16
}

/// `k8s-AA-BB-CC-DD`, hex-encoding the four octets of `ip` — exactly
/// 15 characters, within the kernel's 15-character link-name limit.
/// Deliberately not the dotted-decimal form: hex encoding derives
/// uniqueness from the address bytes rather than their string length.
pub fn build_tunnel_name(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("k8s-{:02x}-{:02x}-{:02x}-{:02x}", o[0], o[1], o[2], o[3])
}

/// `SPI = 0xC000_0000 | (src_numeral << 16) | (dst_numeral << 2) | proto_bit`.
pub fn compute_spi(src_numeral: u16, dst_numeral: u16, proto_bit: u8) -> u32 {
    0xC000_0000 | ((src_numeral as u32) << 16) | ((dst_numeral as u32) << 2) | (proto_bit as u32)
}

pub fn parse_ipv4(addr: &str) -> Result<Ipv4Addr> {
    addr.parse()
        .map_err(|_| anyhow::anyhow!("{addr} is not a valid IPv4 address"))
}

pub fn require_pod_cidr(cidr: Option<Ipv4Network>, node_name: &str) -> Result<Ipv4Network> {
    match cidr {
        Some(c) => Ok(c),
        None => bail!("node {node_name} has no pod CIDR"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_derivation() {
        let mac = map_to_mac("10.244.1.0".parse().unwrap());
        assert_eq!(mac, [0x00, 0x53, 10, 244, 1, 0]);
    }

    #[test]
    fn tunnel_name_derivation() {
        let name = build_tunnel_name("10.244.1.0".parse().unwrap());
        assert_eq!(name, "k8s-0a-f4-01-00");
        assert_eq!(name.len(), 15);
    }

    #[test]
    fn node_numeral_derivation() {
        let cidr: Ipv4Network = "10.244.0.0/24".parse().unwrap();
        assert_eq!(compute_node_numeral(cidr), 0);
        let cidr: Ipv4Network = "10.244.1.0/24".parse().unwrap();
        assert_eq!(compute_node_numeral(cidr), 1);
    }

    #[test]
    fn spi_derivation_places_numerals_at_their_shift() {
        // src_numeral occupies bits 16-29, dst_numeral bits 2-15, the low
        // bit carries the AH/ESP selector.
        assert_eq!(compute_spi(0, 0, 0), 0xC0000000);
        assert_eq!(compute_spi(0, 0, 1), 0xC0000001);
        assert_eq!(compute_spi(1, 0, 0), 0xC0010000);
        assert_eq!(compute_spi(1, 0, 1), 0xC0010001);
        assert_eq!(compute_spi(0, 1, 0), 0xC0000004);
    }
}
