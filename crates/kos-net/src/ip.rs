//! IPv4 layer
//!
//! Input validation, local delivery versus forwarding, output with
//! fragmentation, and the netfilter hook points along each path.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use kos_core::bytes::{inet_checksum, ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::{Layer, PacketBuffer};

use crate::ether::ETH_P_IPV4;
use crate::icmp;
use crate::netfilter::{Hook, PacketMeta, Verdict};
use crate::NetStack;

/// Transport protocol numbers
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Fragmentation control bits in the flags/offset field
pub const IP_DF: u16 = 0x4000;
pub const IP_MF: u16 = 0x2000;
pub const IP_OFFMASK: u16 = 0x1FFF;

/// Default time-to-live for locally originated packets
pub const IP_DEFAULT_TTL: u8 = 64;

const IP_VERSION: u8 = 4;
const IP_HDR_MIN: usize = 20;
const IP_HDR_MAX: usize = 60;

/// Decoded IPv4 header
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    /// Header length in bytes
    pub ihl: usize,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse and structurally validate a header
    ///
    /// The checksum field is decoded but not verified here; the input
    /// path verifies it over the raw header bytes.
    pub fn parse(data: &[u8]) -> KernelResult<Ipv4Header> {
        let mut r = ByteReader::new(data);
        let ver_ihl = r.read_u8()?;
        if ver_ihl >> 4 != IP_VERSION {
            return Err(KernelError::ProtocolError);
        }
        let ihl = ((ver_ihl & 0x0F) as usize) * 4;
        if !(IP_HDR_MIN..=IP_HDR_MAX).contains(&ihl) {
            return Err(KernelError::ProtocolError);
        }
        let tos = r.read_u8()?;
        let total_len = r.read_u16()?;
        if (total_len as usize) < ihl {
            return Err(KernelError::ProtocolError);
        }
        let id = r.read_u16()?;
        let flags_frag = r.read_u16()?;
        let ttl = r.read_u8()?;
        let protocol = r.read_u8()?;
        let checksum = r.read_u16()?;
        let src = Ipv4Addr::from(r.read_array::<4>()?);
        let dst = Ipv4Addr::from(r.read_array::<4>()?);
        if data.len() < ihl {
            return Err(KernelError::ProtocolError);
        }
        Ok(Ipv4Header {
            ihl,
            tos,
            total_len,
            id,
            flags_frag,
            ttl,
            protocol,
            checksum,
            src,
            dst,
        })
    }

    /// Encode a 20-byte header with a freshly computed checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(IP_HDR_MIN);
        w.write_u8((IP_VERSION << 4) | (IP_HDR_MIN as u8 / 4));
        w.write_u8(self.tos);
        w.write_u16(self.total_len);
        w.write_u16(self.id);
        w.write_u16(self.flags_frag);
        w.write_u8(self.ttl);
        w.write_u8(self.protocol);
        w.write_u16(0);
        w.write_slice(&self.src.octets());
        w.write_slice(&self.dst.octets());
        let sum = inet_checksum(w.bytes());
        w.set_u16_at(10, sum).expect("fixed header offset");
        w.into_vec()
    }

    /// Payload offset of this fragment in bytes
    #[inline]
    pub fn frag_offset(&self) -> usize {
        ((self.flags_frag & IP_OFFMASK) as usize) * 8
    }

    #[inline]
    pub fn more_frags(&self) -> bool {
        self.flags_frag & IP_MF != 0
    }

    #[inline]
    pub fn dont_frag(&self) -> bool {
        self.flags_frag & IP_DF != 0
    }

    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_frags() || self.frag_offset() > 0
    }
}

impl NetStack {
    /// IPv4 input path
    pub(crate) fn ip_input(&self, ifindex: u32, mut pkt: PacketBuffer) {
        pkt.mark_layer(Layer::L3);
        self.stats.ip_in.inc();

        let hdr = match Ipv4Header::parse(pkt.data()) {
            Ok(h) => h,
            Err(_) => {
                self.stats.ip_in_errors.inc();
                return;
            }
        };

        if pkt.len() < hdr.total_len as usize {
            self.stats.ip_in_errors.inc();
            return;
        }
        // Frames may be padded below the Ethernet minimum; trim them.
        if pkt.truncate(hdr.total_len as usize).is_err() {
            self.stats.ip_in_errors.inc();
            return;
        }

        if inet_checksum(&pkt.data()[..hdr.ihl]) != 0 {
            self.stats.ip_in_errors.inc();
            return;
        }

        let meta = PacketMeta {
            ifindex,
            src: hdr.src,
            dst: hdr.dst,
            protocol: hdr.protocol,
        };
        match self.netfilter_run(Hook::PreRouting, &mut pkt, &meta) {
            Verdict::Accept => {}
            _ => {
                self.stats.ip_in_dropped.inc();
                return;
            }
        }

        if self.is_local_addr(hdr.dst) || self.iface_is_broadcast_dst(ifindex, hdr.dst) {
            self.ip_local_input(ifindex, hdr, pkt);
        } else {
            self.ip_forward(ifindex, hdr, pkt);
        }
    }

    fn iface_is_broadcast_dst(&self, ifindex: u32, dst: Ipv4Addr) -> bool {
        self.iface_by_index(ifindex)
            .map(|i| i.broadcast() == Some(dst))
            .unwrap_or(false)
    }

    /// Local delivery: reassemble if fragmented, then demux by protocol
    fn ip_local_input(&self, ifindex: u32, hdr: Ipv4Header, mut pkt: PacketBuffer) {
        if hdr.is_fragment() {
            let payload = &pkt.data()[hdr.ihl..];
            match self.reasm_fragment(&hdr, payload) {
                Some(full) => {
                    let mut whole = PacketBuffer::from_slice(&full);
                    whole.ingress = Some(ifindex);
                    whole.timestamp = pkt.timestamp;
                    whole.mark_layer(Layer::L4);
                    self.ip_protocol_demux(ifindex, hdr, whole);
                }
                None => {} // waiting for more fragments
            }
            return;
        }

        let meta = PacketMeta {
            ifindex,
            src: hdr.src,
            dst: hdr.dst,
            protocol: hdr.protocol,
        };
        match self.netfilter_run(Hook::LocalIn, &mut pkt, &meta) {
            Verdict::Accept => {}
            _ => {
                self.stats.ip_in_dropped.inc();
                return;
            }
        }

        if pkt.pull(hdr.ihl).is_err() {
            self.stats.ip_in_errors.inc();
            return;
        }
        pkt.mark_layer(Layer::L4);
        self.ip_protocol_demux(ifindex, hdr, pkt);
    }

    fn ip_protocol_demux(&self, ifindex: u32, hdr: Ipv4Header, pkt: PacketBuffer) {
        match hdr.protocol {
            IPPROTO_ICMP => self.icmp_input(ifindex, &hdr, pkt),
            IPPROTO_TCP => self.tcp_input(ifindex, &hdr, pkt),
            IPPROTO_UDP => self.udp_input(ifindex, &hdr, pkt),
            other => {
                log::trace!("no handler for ip protocol {}", other);
                self.stats.ip_in_dropped.inc();
                self.icmp_send_error(
                    &hdr,
                    pkt.data(),
                    icmp::ICMP_DEST_UNREACH,
                    icmp::ICMP_PROT_UNREACH,
                    0,
                );
            }
        }
    }

    /// Forward a packet that is not addressed to us
    fn ip_forward(&self, ifindex: u32, hdr: Ipv4Header, mut pkt: PacketBuffer) {
        if !self.forwarding_enabled() {
            self.stats.ip_in_dropped.inc();
            return;
        }

        if hdr.ttl <= 1 {
            self.stats.ip_forward_errors.inc();
            self.icmp_send_error(
                &hdr,
                &pkt.data()[hdr.ihl..],
                icmp::ICMP_TIME_EXCEEDED,
                icmp::ICMP_EXC_TTL,
                0,
            );
            return;
        }

        let route = match self.route_lookup(hdr.dst) {
            Ok(r) => r,
            Err(_) => {
                self.stats.ip_forward_errors.inc();
                self.icmp_send_error(
                    &hdr,
                    &pkt.data()[hdr.ihl..],
                    icmp::ICMP_DEST_UNREACH,
                    icmp::ICMP_NET_UNREACH,
                    0,
                );
                return;
            }
        };

        // Never bounce a packet out the interface it came in on.
        if route.ifindex == ifindex {
            self.stats.ip_forward_errors.inc();
            return;
        }

        let meta = PacketMeta {
            ifindex,
            src: hdr.src,
            dst: hdr.dst,
            protocol: hdr.protocol,
        };
        match self.netfilter_run(Hook::Forward, &mut pkt, &meta) {
            Verdict::Accept => {}
            _ => {
                self.stats.ip_in_dropped.inc();
                return;
            }
        }

        // Decrement TTL and patch the checksum in place.
        {
            let data = pkt.data_mut();
            data[8] = hdr.ttl - 1;
            data[10] = 0;
            data[11] = 0;
            let sum = inet_checksum(&data[..hdr.ihl]);
            data[10..12].copy_from_slice(&sum.to_be_bytes());
        }

        match self.netfilter_run(Hook::PostRouting, &mut pkt, &meta) {
            Verdict::Accept => {}
            _ => {
                self.stats.ip_in_dropped.inc();
                return;
            }
        }

        let next_hop = route.gateway.unwrap_or(hdr.dst);

        // Egress MTU check: refragment, or bounce Frag-Needed on DF.
        if let Some(egress) = self.iface_by_index(route.ifindex) {
            if pkt.len() > egress.mtu {
                if hdr.dont_frag() {
                    self.stats.ip_forward_errors.inc();
                    self.icmp_send_error(
                        &hdr,
                        &pkt.data()[hdr.ihl..],
                        icmp::ICMP_DEST_UNREACH,
                        icmp::ICMP_FRAG_NEEDED,
                        egress.mtu as u32,
                    );
                    return;
                }
                self.stats.ip_forwarded.inc();
                self.ip_refragment(route.ifindex, next_hop, &hdr, &pkt, egress.mtu);
                return;
            }
        }

        self.stats.ip_forwarded.inc();
        self.ip_finish_send(route.ifindex, next_hop, pkt);
    }

    /// Split a forwarded packet to fit a smaller egress MTU
    ///
    /// Keeps the original identification field so the far end can group
    /// our fragments with any produced upstream.
    fn ip_refragment(
        &self,
        ifindex: u32,
        next_hop: Ipv4Addr,
        hdr: &Ipv4Header,
        pkt: &PacketBuffer,
        mtu: usize,
    ) {
        let payload = &pkt.data()[hdr.ihl..];
        let chunk = (mtu - IP_HDR_MIN) & !7;
        if chunk == 0 {
            self.stats.ip_forward_errors.inc();
            return;
        }
        let base_offset = hdr.frag_offset();
        let had_more = hdr.more_frags();

        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + chunk).min(payload.len());
            let more = end < payload.len() || had_more;
            let frag_hdr = Ipv4Header {
                ihl: IP_HDR_MIN,
                tos: hdr.tos,
                total_len: (IP_HDR_MIN + end - offset) as u16,
                id: hdr.id,
                flags_frag: (((base_offset + offset) / 8) as u16 & IP_OFFMASK)
                    | if more { IP_MF } else { 0 },
                ttl: hdr.ttl - 1,
                protocol: hdr.protocol,
                checksum: 0,
                src: hdr.src,
                dst: hdr.dst,
            };
            match self.ip_build_packet(&frag_hdr, &payload[offset..end]) {
                Ok(frag) => {
                    self.stats.ip_frags_created.inc();
                    self.ip_finish_send(ifindex, next_hop, frag);
                }
                Err(_) => self.stats.ip_forward_errors.inc(),
            }
            offset = end;
        }
    }

    /// Build and transmit an IPv4 packet carrying `payload`
    ///
    /// `src` of `None` picks the egress interface address. Fragments are
    /// produced when the packet exceeds the egress MTU and DF is clear.
    pub(crate) fn ip_output(
        &self,
        src: Option<Ipv4Addr>,
        dst: Ipv4Addr,
        protocol: u8,
        ttl: u8,
        df: bool,
        payload: &[u8],
    ) -> KernelResult<()> {
        let route = self.route_lookup(dst)?;
        let iface = self
            .iface_by_index(route.ifindex)
            .ok_or(KernelError::HostUnreachable)?;
        if !iface.is_up() {
            return Err(KernelError::HostUnreachable);
        }
        let src = src
            .or_else(|| iface.addr())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let id = self.ip_ident.fetch_add(1, Ordering::Relaxed);
        let mtu = iface.mtu;
        let total = IP_HDR_MIN + payload.len();
        self.stats.ip_out.inc();

        if total <= mtu {
            let hdr = Ipv4Header {
                ihl: IP_HDR_MIN,
                tos: 0,
                total_len: total as u16,
                id,
                flags_frag: if df { IP_DF } else { 0 },
                ttl,
                protocol,
                checksum: 0,
                src,
                dst,
            };
            let pkt = self.ip_build_packet(&hdr, payload)?;
            return self.ip_send_one(route.ifindex, &route, &hdr, pkt);
        }

        if df {
            self.stats.ip_out_errors.inc();
            let hdr = Ipv4Header {
                ihl: IP_HDR_MIN,
                tos: 0,
                total_len: total as u16,
                id,
                flags_frag: IP_DF,
                ttl,
                protocol,
                checksum: 0,
                src,
                dst,
            };
            self.icmp_send_error(
                &hdr,
                payload,
                icmp::ICMP_DEST_UNREACH,
                icmp::ICMP_FRAG_NEEDED,
                mtu as u32,
            );
            return Err(KernelError::MessageTooBig);
        }

        // Fragment: every chunk but the last is the largest multiple of
        // eight that fits the MTU.
        let chunk = (mtu - IP_HDR_MIN) & !7;
        if chunk == 0 {
            return Err(KernelError::MessageTooBig);
        }
        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + chunk).min(payload.len());
            let more = end < payload.len();
            let hdr = Ipv4Header {
                ihl: IP_HDR_MIN,
                tos: 0,
                total_len: (IP_HDR_MIN + end - offset) as u16,
                id,
                flags_frag: ((offset / 8) as u16 & IP_OFFMASK) | if more { IP_MF } else { 0 },
                ttl,
                protocol,
                checksum: 0,
                src,
                dst,
            };
            let pkt = self.ip_build_packet(&hdr, &payload[offset..end])?;
            self.stats.ip_frags_created.inc();
            self.ip_send_one(route.ifindex, &route, &hdr, pkt)?;
            offset = end;
        }
        Ok(())
    }

    fn ip_build_packet(&self, hdr: &Ipv4Header, payload: &[u8]) -> KernelResult<PacketBuffer> {
        let mut pkt =
            PacketBuffer::with_headroom(14 + IP_HDR_MIN + payload.len(), 14 + IP_HDR_MIN)?;
        pkt.put(payload)?;
        let buf = pkt.push(IP_HDR_MIN)?;
        buf.copy_from_slice(&hdr.encode());
        pkt.mark_layer(Layer::L3);
        pkt.timestamp = self.clock.now();
        Ok(pkt)
    }

    fn ip_send_one(
        &self,
        ifindex: u32,
        route: &crate::route::Route,
        hdr: &Ipv4Header,
        mut pkt: PacketBuffer,
    ) -> KernelResult<()> {
        let meta = PacketMeta {
            ifindex,
            src: hdr.src,
            dst: hdr.dst,
            protocol: hdr.protocol,
        };
        match self.netfilter_run(Hook::LocalOut, &mut pkt, &meta) {
            Verdict::Accept => {}
            _ => {
                self.stats.ip_out_dropped.inc();
                return Ok(());
            }
        }
        match self.netfilter_run(Hook::PostRouting, &mut pkt, &meta) {
            Verdict::Accept => {}
            _ => {
                self.stats.ip_out_dropped.inc();
                return Ok(());
            }
        }

        let next_hop = route.gateway.unwrap_or(hdr.dst);
        self.ip_finish_send(ifindex, next_hop, pkt);
        Ok(())
    }

    /// Resolve the link address and emit the frame
    fn ip_finish_send(&self, ifindex: u32, next_hop: Ipv4Addr, pkt: PacketBuffer) {
        let iface = match self.iface_by_index(ifindex) {
            Some(i) => i,
            None => return,
        };

        if iface.is_loopback() {
            let _ = self.ether_output(ifindex, iface.mac, ETH_P_IPV4, pkt);
            return;
        }

        // Subnet or limited broadcast goes straight to the broadcast MAC.
        if next_hop == Ipv4Addr::BROADCAST || iface.broadcast() == Some(next_hop) {
            let _ = self.ether_output(ifindex, crate::ether::MacAddr::BROADCAST, ETH_P_IPV4, pkt);
            return;
        }

        match self.arp_resolve(ifindex, next_hop, pkt) {
            Ok((mac, pkt)) => {
                let _ = self.ether_output(ifindex, mac, ETH_P_IPV4, pkt);
            }
            Err(KernelError::WouldBlock) => {
                // Parked on the incomplete ARP entry; the reply flushes it.
            }
            Err(_) => self.stats.ip_out_errors.inc(),
        }
    }

    /// Periodic reassembly expiry, run by the timer worker
    pub(crate) fn ip_sweep(&self, now: Duration) {
        self.reasm_sweep(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Ipv4Header {
        Ipv4Header {
            ihl: 20,
            tos: 0,
            total_len: 40,
            id: 0x1234,
            flags_frag: IP_DF,
            ttl: 64,
            protocol: IPPROTO_TCP,
            checksum: 0,
            src: Ipv4Addr::new(192, 168, 1, 1),
            dst: Ipv4Addr::new(192, 168, 1, 2),
        }
    }

    #[test]
    fn test_header_encode_verifies() {
        let wire = sample_header().encode();
        assert_eq!(wire.len(), 20);
        // A stored checksum must make the header sum to zero.
        assert_eq!(inet_checksum(&wire), 0);
    }

    #[test]
    fn test_header_parse_round_trip() {
        let hdr = sample_header();
        let wire = hdr.encode();
        let back = Ipv4Header::parse(&wire).unwrap();
        assert_eq!(back.total_len, 40);
        assert_eq!(back.id, 0x1234);
        assert!(back.dont_frag());
        assert!(!back.more_frags());
        assert_eq!(back.src, hdr.src);
        assert_eq!(back.dst, hdr.dst);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut wire = sample_header().encode();
        wire[0] = 0x65; // version 6
        assert!(Ipv4Header::parse(&wire).is_err());
    }

    #[test]
    fn test_header_rejects_short_ihl() {
        let mut wire = sample_header().encode();
        wire[0] = 0x44; // ihl 16 bytes
        assert!(Ipv4Header::parse(&wire).is_err());
    }

    #[test]
    fn test_fragment_fields() {
        let mut hdr = sample_header();
        hdr.flags_frag = IP_MF | 185;
        assert!(hdr.more_frags());
        assert_eq!(hdr.frag_offset(), 1480);
        assert!(hdr.is_fragment());
    }
}
