// Author: Lukas Bower
// Purpose: Header inspection for TCP segmentation offload requests.

//! TSO header parsing.

use cohesix_sge_wire::txpkt::{CPL_ETH_II, CPL_ETH_II_VLAN};

use crate::error::MalformedReason;

const ETH_HLEN: usize = 14;
const VLAN_HLEN: usize = 4;
pub(crate) const ETHERTYPE_VLAN: u16 = 0x8100;
pub(crate) const ETHERTYPE_IPV4: u16 = 0x0800;
pub(crate) const ETHERTYPE_IPV6: u16 = 0x86dd;
pub(crate) const IPV6_HLEN: usize = 40;
pub(crate) const IPPROTO_TCP: u8 = 6;

/// Smallest Ethernet + IP + TCP header stack accepted for segmentation.
pub const LSO_MIN_HDR_LEN: usize = ETH_HLEN + 20 + 20;

/// Header facts the hardware needs to segment a TCP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsoHeaders {
    /// Encapsulation code for the LSO info word.
    pub eth_type: u32,
    /// IP header length in 32-bit words.
    pub ip_words: u32,
    /// TCP header length in 32-bit words.
    pub tcp_words: u32,
    /// Frame carries IPv6.
    pub ipv6: bool,
    /// Bytes of Ethernet, IP and TCP headers.
    pub hdr_len: usize,
}

/// Parses the header stack at the front of `frame`.
pub fn parse_headers(frame: &[u8]) -> Result<LsoHeaders, MalformedReason> {
    if frame.len() < LSO_MIN_HDR_LEN {
        return Err(MalformedReason::LsoHeaderTooShort);
    }
    let mut eth_len = ETH_HLEN;
    let mut eth_type = CPL_ETH_II;
    let mut ethertype = be16(frame, 12);
    if ethertype == ETHERTYPE_VLAN {
        eth_len += VLAN_HLEN;
        eth_type = CPL_ETH_II_VLAN;
        ethertype = be16(frame, 16);
    }
    let ip = &frame[eth_len..];
    let (ip_len, proto, ipv6) = match ethertype {
        ETHERTYPE_IPV4 => {
            let version = ip[0] >> 4;
            let ihl = usize::from(ip[0] & 0x0f) * 4;
            if version != 4 || ihl < 20 {
                return Err(MalformedReason::LsoBadHeaderLength);
            }
            (ihl, ip[9], false)
        }
        ETHERTYPE_IPV6 => (IPV6_HLEN, ip[6], true),
        _ => return Err(MalformedReason::LsoUnsupportedEtherType),
    };
    if proto != IPPROTO_TCP {
        return Err(MalformedReason::LsoNotTcp);
    }
    let tcp_off = eth_len + ip_len;
    if frame.len() < tcp_off + 20 {
        return Err(MalformedReason::LsoHeaderTooShort);
    }
    let tcp_len = usize::from(frame[tcp_off + 12] >> 4) * 4;
    if tcp_len < 20 {
        return Err(MalformedReason::LsoBadHeaderLength);
    }
    let hdr_len = tcp_off + tcp_len;
    if frame.len() < hdr_len {
        return Err(MalformedReason::LsoHeaderTooShort);
    }
    Ok(LsoHeaders {
        eth_type,
        ip_words: (ip_len / 4) as u32,
        tcp_words: (tcp_len / 4) as u32,
        ipv6,
        hdr_len,
    })
}

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tcp_frame;

    #[test]
    fn ipv4_frame_parses() {
        let hdrs = parse_headers(&tcp_frame(None, false, 1000)).expect("valid");
        assert_eq!(hdrs.hdr_len, 54);
        assert_eq!(hdrs.ip_words, 5);
        assert_eq!(hdrs.tcp_words, 5);
        assert_eq!(hdrs.eth_type, CPL_ETH_II);
        assert!(!hdrs.ipv6);
    }

    #[test]
    fn tagged_ipv6_frame_parses() {
        let hdrs = parse_headers(&tcp_frame(Some(7), true, 10)).expect("valid");
        assert_eq!(hdrs.hdr_len, 18 + 40 + 20);
        assert_eq!(hdrs.eth_type, CPL_ETH_II_VLAN);
        assert!(hdrs.ipv6);
    }

    #[test]
    fn truncated_and_foreign_frames_are_rejected() {
        assert_eq!(
            parse_headers(&[0u8; 40]),
            Err(MalformedReason::LsoHeaderTooShort)
        );
        let mut udp = tcp_frame(None, false, 100);
        udp[14 + 9] = 17;
        assert_eq!(parse_headers(&udp), Err(MalformedReason::LsoNotTcp));
        let mut arp = tcp_frame(None, false, 100);
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            parse_headers(&arp),
            Err(MalformedReason::LsoUnsupportedEtherType)
        );
    }
}
