//! ICMP
//!
//! Echo request/reply, plus the two error types the IP layer emits:
//! Destination Unreachable and Time Exceeded. A skeletal ICMPv6 echo
//! responder answers pings over the IPv6 input path; nothing else of
//! IPv6 is implemented.

use std::net::Ipv4Addr;

use kos_core::bytes::{checksum_add, checksum_finish, inet_checksum, ByteReader, ByteWriter};
use kos_core::error::KernelResult;
use kos_core::pktbuf::PacketBuffer;

use crate::ether::{EthHeader, ETH_P_IPV6};
use crate::ip::{Ipv4Header, IPPROTO_ICMP, IP_DEFAULT_TTL};
use crate::NetStack;

/// ICMP message types
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// Destination Unreachable codes
pub const ICMP_NET_UNREACH: u8 = 0;
pub const ICMP_HOST_UNREACH: u8 = 1;
pub const ICMP_PROT_UNREACH: u8 = 2;
pub const ICMP_PORT_UNREACH: u8 = 3;
pub const ICMP_FRAG_NEEDED: u8 = 4;

/// Time Exceeded codes
pub const ICMP_EXC_TTL: u8 = 0;

const ICMP_HDR_LEN: usize = 8;

/// Decoded ICMP header
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Identifier/sequence for echo, MTU hint for frag-needed, unused
    /// otherwise
    pub rest: u32,
}

impl IcmpHeader {
    pub fn parse(data: &[u8]) -> KernelResult<IcmpHeader> {
        let mut r = ByteReader::new(data);
        Ok(IcmpHeader {
            icmp_type: r.read_u8()?,
            code: r.read_u8()?,
            checksum: r.read_u16()?,
            rest: r.read_u32()?,
        })
    }
}

/// Build a full ICMP message with its checksum
fn icmp_build(icmp_type: u8, code: u8, rest: u32, payload: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(ICMP_HDR_LEN + payload.len());
    w.write_u8(icmp_type);
    w.write_u8(code);
    w.write_u16(0);
    w.write_u32(rest);
    w.write_slice(payload);
    let sum = inet_checksum(w.bytes());
    w.set_u16_at(2, sum).expect("fixed checksum offset");
    w.into_vec()
}

impl NetStack {
    /// Handle a received ICMP message addressed to us
    pub(crate) fn icmp_input(&self, _ifindex: u32, ip: &Ipv4Header, pkt: PacketBuffer) {
        let data = pkt.data();
        if inet_checksum(data) != 0 {
            self.stats.icmp_in_errors.inc();
            return;
        }
        let hdr = match IcmpHeader::parse(data) {
            Ok(h) => h,
            Err(_) => {
                self.stats.icmp_in_errors.inc();
                return;
            }
        };
        self.stats.icmp_in.inc();

        match hdr.icmp_type {
            ICMP_ECHO_REQUEST => {
                // Reflect the identifier, sequence and payload back to
                // the original source.
                let reply = icmp_build(ICMP_ECHO_REPLY, 0, hdr.rest, &data[ICMP_HDR_LEN..]);
                let _ = self.ip_output(
                    None,
                    ip.src,
                    IPPROTO_ICMP,
                    IP_DEFAULT_TTL,
                    false,
                    &reply,
                );
            }
            ICMP_ECHO_REPLY => {
                log::trace!("echo reply from {}", ip.src);
            }
            ICMP_DEST_UNREACH | ICMP_TIME_EXCEEDED => {
                log::debug!(
                    "icmp error type {} code {} from {}",
                    hdr.icmp_type,
                    hdr.code,
                    ip.src
                );
            }
            _ => self.stats.icmp_in_errors.inc(),
        }
    }

    /// Emit an ICMP error about a received packet
    ///
    /// Carries the offending IP header plus the first eight payload
    /// bytes, per RFC 792. Errors are never sent about ICMP errors,
    /// fragments past the first, or broadcast packets.
    pub(crate) fn icmp_send_error(
        &self,
        orig: &Ipv4Header,
        orig_payload: &[u8],
        icmp_type: u8,
        code: u8,
        info: u32,
    ) {
        if orig.frag_offset() > 0 {
            return;
        }
        if orig.src == Ipv4Addr::UNSPECIFIED || orig.src == Ipv4Addr::BROADCAST {
            return;
        }
        if orig.protocol == IPPROTO_ICMP {
            if let Ok(h) = IcmpHeader::parse(orig_payload) {
                let is_error = matches!(h.icmp_type, ICMP_DEST_UNREACH | ICMP_TIME_EXCEEDED);
                if is_error {
                    return;
                }
            }
        }

        let mut quoted = orig.encode();
        quoted.extend_from_slice(&orig_payload[..orig_payload.len().min(8)]);
        let msg = icmp_build(icmp_type, code, info, &quoted);

        self.stats.icmp_out.inc();
        let _ = self.ip_output(None, orig.src, IPPROTO_ICMP, IP_DEFAULT_TTL, false, &msg);
    }

    /// Send an echo request (ping) to `dst`
    pub fn ping(&self, dst: Ipv4Addr, ident: u16, seq: u16, payload: &[u8]) -> KernelResult<()> {
        let rest = ((ident as u32) << 16) | seq as u32;
        let msg = icmp_build(ICMP_ECHO_REQUEST, 0, rest, payload);
        self.stats.icmp_out.inc();
        self.ip_output(None, dst, IPPROTO_ICMP, IP_DEFAULT_TTL, false, &msg)
    }

    /// Skeletal IPv6 input: answer ICMPv6 echo requests, drop the rest
    pub(crate) fn ip6_input(&self, ifindex: u32, eth: EthHeader, pkt: PacketBuffer) {
        let data = pkt.data();
        // Fixed 40-byte header, no extension header support.
        if data.len() < 40 || data[0] >> 4 != 6 {
            self.stats.ip_in_errors.inc();
            return;
        }
        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let next_header = data[6];
        if next_header != 58 || data.len() < 40 + payload_len || payload_len < 8 {
            self.stats.ip_in_dropped.inc();
            return;
        }
        let src: [u8; 16] = data[8..24].try_into().expect("fixed slice");
        let dst: [u8; 16] = data[24..40].try_into().expect("fixed slice");
        let body = &data[40..40 + payload_len];

        // 128 = Echo Request, 129 = Echo Reply.
        if body[0] != 128 {
            self.stats.ip_in_dropped.inc();
            return;
        }

        let mut reply = Vec::with_capacity(body.len());
        reply.push(129u8);
        reply.push(0);
        reply.extend_from_slice(&[0, 0]);
        reply.extend_from_slice(&body[4..]);

        // ICMPv6 checksum covers an IPv6 pseudo-header with the
        // addresses swapped for the reply direction.
        let mut sum = checksum_add(0, &dst);
        sum = checksum_add(sum, &src);
        sum = checksum_add(sum, &(reply.len() as u32).to_be_bytes());
        sum = checksum_add(sum, &[0, 0, 0, 58]);
        sum = checksum_add(sum, &reply);
        let cks = checksum_finish(sum);
        reply[2..4].copy_from_slice(&cks.to_be_bytes());

        let mut out = ByteWriter::with_capacity(40 + reply.len());
        out.write_u8(0x60);
        out.write_slice(&[0, 0, 0]);
        out.write_u16(reply.len() as u16);
        out.write_u8(58);
        out.write_u8(255);
        out.write_slice(&dst);
        out.write_slice(&src);
        out.write_slice(&reply);

        let frame = out.into_vec();
        let mut buf = match PacketBuffer::with_headroom(frame.len() + 14, 14) {
            Ok(b) => b,
            Err(_) => return,
        };
        if buf.put(&frame).is_err() {
            return;
        }
        self.stats.icmp_out.inc();
        let _ = self.ether_output(ifindex, eth.src, ETH_P_IPV6, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_build_checksums() {
        let msg = icmp_build(ICMP_ECHO_REQUEST, 0, 0x0001_0002, b"abcdefgh");
        assert_eq!(msg[0], ICMP_ECHO_REQUEST);
        assert_eq!(inet_checksum(&msg), 0);
    }

    #[test]
    fn test_icmp_parse() {
        let msg = icmp_build(ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, 0, &[]);
        let hdr = IcmpHeader::parse(&msg).unwrap();
        assert_eq!(hdr.icmp_type, ICMP_DEST_UNREACH);
        assert_eq!(hdr.code, ICMP_PORT_UNREACH);
    }
}
