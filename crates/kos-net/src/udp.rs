//! UDP
//!
//! Stateless datagram transport. Sockets are indexed by (local addr,
//! local port); binding to port 0 draws from the ephemeral range with a
//! rotating counter. A connected socket filters datagrams whose source
//! does not match its peer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use kos_core::bytes::{checksum_add, checksum_finish, ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::PacketBuffer;
use kos_core::SocketId;

use crate::icmp::{ICMP_DEST_UNREACH, ICMP_PORT_UNREACH};
use crate::ip::{Ipv4Header, IPPROTO_UDP, IP_DEFAULT_TTL};
use crate::socket::Socket;
use crate::NetStack;

const UDP_HDR_LEN: usize = 8;

/// DHCP client port, delivered to the in-stack client when unbound
const DHCP_CLIENT_PORT: u16 = 68;

/// Decoded UDP header
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(data: &[u8]) -> KernelResult<UdpHeader> {
        let mut r = ByteReader::new(data);
        let hdr = UdpHeader {
            src_port: r.read_u16()?,
            dst_port: r.read_u16()?,
            length: r.read_u16()?,
            checksum: r.read_u16()?,
        };
        if (hdr.length as usize) < UDP_HDR_LEN || hdr.length as usize > data.len() {
            return Err(KernelError::ProtocolError);
        }
        Ok(hdr)
    }
}

/// Build a datagram with its pseudo-header checksum
pub fn build_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = (UDP_HDR_LEN + payload.len()) as u16;
    let mut w = ByteWriter::with_capacity(len as usize);
    w.write_u16(src_port);
    w.write_u16(dst_port);
    w.write_u16(len);
    w.write_u16(0);
    w.write_slice(payload);

    let sum = udp_checksum(src, dst, w.bytes());
    // An all-zero computed checksum is transmitted as all-ones.
    let sum = if sum == 0 { 0xFFFF } else { sum };
    w.set_u16_at(6, sum).expect("fixed checksum offset");
    w.into_vec()
}

/// Pseudo-header checksum over a full datagram
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, dgram: &[u8]) -> u16 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum = checksum_add(sum, &[0, IPPROTO_UDP]);
    sum = checksum_add(sum, &(dgram.len() as u16).to_be_bytes());
    sum = checksum_add(sum, dgram);
    checksum_finish(sum)
}

/// Socket lookup table, used under the stack's udp lock
#[derive(Default)]
pub struct UdpRegistry {
    pub(crate) bound: HashMap<(Ipv4Addr, u16), SocketId>,
    next_ephemeral: u16,
}

impl UdpRegistry {
    /// Allocate an ephemeral port in [32768, 65535], skipping ports in
    /// use on the same address
    fn alloc_ephemeral(&mut self, addr: Ipv4Addr) -> KernelResult<u16> {
        const LO: u16 = 32768;
        if self.next_ephemeral < LO {
            self.next_ephemeral = LO;
        }
        for _ in 0..=(u16::MAX - LO) {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX { LO } else { port + 1 };
            if !self.bound.contains_key(&(addr, port))
                && !self.bound.contains_key(&(Ipv4Addr::UNSPECIFIED, port))
            {
                return Ok(port);
            }
        }
        Err(KernelError::AddressNotAvailable)
    }
}

impl NetStack {
    /// Bind a UDP socket
    pub(crate) fn udp_bind(
        &self,
        id: SocketId,
        sock: &Arc<Socket>,
        addr: SocketAddrV4,
    ) -> KernelResult<()> {
        let reuse = sock.opts.lock().unwrap().reuse_addr;
        let mut reg = self.udp.lock().unwrap();

        let port = if addr.port() == 0 {
            reg.alloc_ephemeral(*addr.ip())?
        } else {
            let key = (*addr.ip(), addr.port());
            if let Some(&other) = reg.bound.get(&key) {
                let other_reuse = self
                    .socket_get(other)
                    .map(|s| s.opts.lock().unwrap().reuse_addr)
                    .unwrap_or(false);
                if !(reuse && other_reuse) {
                    return Err(KernelError::AddressInUse);
                }
            }
            addr.port()
        };

        let local = SocketAddrV4::new(*addr.ip(), port);
        reg.bound.insert((*local.ip(), port), id);
        drop(reg);

        sock.core.lock().unwrap().local = Some(local);
        Ok(())
    }

    /// Release a UDP binding on close
    pub(crate) fn udp_unbind(&self, id: SocketId, local: SocketAddrV4) {
        let mut reg = self.udp.lock().unwrap();
        if reg.bound.get(&(*local.ip(), local.port())) == Some(&id) {
            reg.bound.remove(&(*local.ip(), local.port()));
        }
    }

    /// UDP input path
    pub(crate) fn udp_input(&self, ifindex: u32, ip: &Ipv4Header, pkt: PacketBuffer) {
        let data = pkt.data();
        let hdr = match UdpHeader::parse(data) {
            Ok(h) => h,
            Err(_) => {
                self.stats.udp_in_errors.inc();
                return;
            }
        };

        // Checksum zero means "not computed" in IPv4 UDP.
        if hdr.checksum != 0 && udp_checksum(ip.src, ip.dst, &data[..hdr.length as usize]) != 0 {
            self.stats.udp_in_errors.inc();
            return;
        }
        self.stats.udp_in.inc();

        let payload = &data[UDP_HDR_LEN..hdr.length as usize];
        let id = {
            let reg = self.udp.lock().unwrap();
            reg.bound
                .get(&(ip.dst, hdr.dst_port))
                .or_else(|| reg.bound.get(&(Ipv4Addr::UNSPECIFIED, hdr.dst_port)))
                .copied()
        };

        let sock = id.and_then(|id| self.socket_get(id).ok());
        let sock = match sock {
            Some(s) => s,
            None => {
                // The in-stack DHCP client listens on port 68 without a
                // socket of its own.
                if hdr.dst_port == DHCP_CLIENT_PORT {
                    self.dhcp_input(ifindex, ip, payload);
                    return;
                }
                self.stats.udp_no_port.inc();
                self.icmp_send_error(ip, data, ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, 0);
                return;
            }
        };

        // Connected sockets only accept their peer.
        let src = SocketAddrV4::new(ip.src, hdr.src_port);
        {
            let core = sock.core.lock().unwrap();
            if let Some(peer) = core.remote {
                if peer != src {
                    self.stats.udp_in_dropped.inc();
                    return;
                }
            }
            if core.shutdown_rd {
                self.stats.udp_in_dropped.inc();
                return;
            }
        }

        let mut q = sock.recv_q.lock().unwrap();
        if !q.push_dgram(src, payload) {
            self.stats.udp_in_dropped.inc();
        }
    }

    /// Transmit a datagram from a socket
    pub(crate) fn udp_output(
        &self,
        sock: &Arc<Socket>,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> KernelResult<usize> {
        // Auto-bind on first send.
        let local = {
            let core = sock.core.lock().unwrap();
            core.local
        };
        let local = match local {
            Some(l) => l,
            None => {
                self.udp_bind(sock.id, sock, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
                sock.core.lock().unwrap().local.expect("just bound")
            }
        };

        // The checksum covers the source address, so the wildcard is
        // resolved to the egress interface address up front.
        let src_ip = if *local.ip() != Ipv4Addr::UNSPECIFIED {
            *local.ip()
        } else {
            let route = self.route_lookup(*dst.ip())?;
            self.iface_by_index(route.ifindex)
                .and_then(|i| i.addr())
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
        };

        let dgram = build_datagram(src_ip, *dst.ip(), local.port(), dst.port(), payload);
        self.stats.udp_out.inc();
        let src = if src_ip == Ipv4Addr::UNSPECIFIED { None } else { Some(src_ip) };
        self.ip_output(src, *dst.ip(), IPPROTO_UDP, IP_DEFAULT_TTL, false, &dgram)?;
        Ok(payload.len())
    }

    /// Link-level datagram send used before the stack has an address
    /// (DHCP DISCOVER/REQUEST broadcasts)
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn udp_send_link(
        &self,
        ifindex: u32,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        dst_mac: crate::ether::MacAddr,
        payload: &[u8],
    ) -> KernelResult<()> {
        let dgram = build_datagram(*src.ip(), *dst.ip(), src.port(), dst.port(), payload);
        let total = 20 + dgram.len();

        let hdr = Ipv4Header {
            ihl: 20,
            tos: 0,
            total_len: total as u16,
            id: self.ip_ident.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            flags_frag: 0,
            ttl: IP_DEFAULT_TTL,
            protocol: IPPROTO_UDP,
            checksum: 0,
            src: *src.ip(),
            dst: *dst.ip(),
        };

        let mut pkt = PacketBuffer::with_headroom(14 + total, 14 + 20)?;
        pkt.put(&dgram)?;
        let buf = pkt.push(20)?;
        buf.copy_from_slice(&hdr.encode());
        self.stats.udp_out.inc();
        self.stats.ip_out.inc();
        self.ether_output(ifindex, dst_mac, crate::ether::ETH_P_IPV4, pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_round_trip() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let dgram = build_datagram(src, dst, 5000, 53, b"query");
        let hdr = UdpHeader::parse(&dgram).unwrap();
        assert_eq!(hdr.src_port, 5000);
        assert_eq!(hdr.dst_port, 53);
        assert_eq!(hdr.length as usize, 8 + 5);
        // Stored checksum verifies to zero over the pseudo-header.
        assert_eq!(udp_checksum(src, dst, &dgram), 0);
    }

    #[test]
    fn test_length_validation() {
        let src = Ipv4Addr::new(1, 1, 1, 1);
        let dst = Ipv4Addr::new(2, 2, 2, 2);
        let mut dgram = build_datagram(src, dst, 1, 2, b"abc");
        // Claim a length longer than the buffer.
        dgram[4] = 0xFF;
        dgram[5] = 0xFF;
        assert!(UdpHeader::parse(&dgram).is_err());
    }

    #[test]
    fn test_ephemeral_rotation_skips_used() {
        let mut reg = UdpRegistry::default();
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let a = reg.alloc_ephemeral(addr).unwrap();
        reg.bound.insert((addr, a), SocketId::new(1));
        let b = reg.alloc_ephemeral(addr).unwrap();
        reg.bound.insert((addr, b), SocketId::new(2));
        assert_ne!(a, b);
        assert!(a >= 32768);
        assert!(b >= 32768);
        // Non-zero by construction of the range.
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }
}
