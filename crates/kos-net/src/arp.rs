//! Address Resolution Protocol
//!
//! Cache of at most 256 IPv4-to-MAC bindings. A miss emits a broadcast
//! request and parks the packet that needed the binding; the reply flushes
//! parked packets. Entries expire after 300 seconds unless PERMANENT.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use kos_core::bytes::{ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::PacketBuffer;

use crate::ether::{MacAddr, ETH_P_ARP, ETH_P_IPV4};
use crate::NetStack;

/// Maximum cache entries
pub const ARP_CACHE_MAX: usize = 256;

/// Lifetime of a non-permanent entry
pub const ARP_TIMEOUT: Duration = Duration::from_secs(300);

/// Packets parked on one incomplete entry
const ARP_PENDING_MAX: usize = 3;

const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ARP_HTYPE_ETHERNET: u16 = 1;

/// Entry flag bits
pub const ATF_COMPLETE: u32 = 0x02;
pub const ATF_PERMANENT: u32 = 0x04;

/// One cache binding
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub flags: u32,
    /// Insertion timestamp on the kernel clock
    pub created: Duration,
    /// Packets waiting for this binding, with their egress interface
    pending: Vec<(u32, PacketBuffer)>,
}

impl ArpEntry {
    fn is_complete(&self) -> bool {
        self.flags & ATF_COMPLETE != 0
    }

    fn is_permanent(&self) -> bool {
        self.flags & ATF_PERMANENT != 0
    }

    fn is_expired(&self, now: Duration) -> bool {
        !self.is_permanent() && now.saturating_sub(self.created) >= ARP_TIMEOUT
    }
}

/// The ARP table proper, always used under the stack's arp lock
#[derive(Default)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, ArpEntry>,
}

impl ArpCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_valid(&self, ip: Ipv4Addr, now: Duration) -> Option<&ArpEntry> {
        self.entries
            .get(&ip)
            .filter(|e| e.is_complete() && !e.is_expired(now))
    }

    /// Insert or update a binding; evicts the oldest non-permanent entry
    /// when the table is full
    fn insert(
        &mut self,
        ip: Ipv4Addr,
        mac: MacAddr,
        flags: u32,
        now: Duration,
    ) -> Vec<(u32, PacketBuffer)> {
        if let Some(entry) = self.entries.get_mut(&ip) {
            entry.mac = mac;
            entry.flags |= flags | ATF_COMPLETE;
            entry.created = now;
            return std::mem::take(&mut entry.pending);
        }

        if self.entries.len() >= ARP_CACHE_MAX {
            self.evict_oldest();
        }
        if self.entries.len() >= ARP_CACHE_MAX {
            log::warn!("arp cache full of permanent entries, dropping {}", ip);
            return Vec::new();
        }

        self.entries.insert(
            ip,
            ArpEntry {
                ip,
                mac,
                flags: flags | ATF_COMPLETE,
                created: now,
                pending: Vec::new(),
            },
        );
        Vec::new()
    }

    fn evict_oldest(&mut self) {
        let victim = self
            .entries
            .values()
            .filter(|e| !e.is_permanent())
            .min_by_key(|e| e.created)
            .map(|e| e.ip);
        if let Some(ip) = victim {
            self.entries.remove(&ip);
        }
    }

    /// Drop expired entries along with any packets still parked on them
    fn expire(&mut self, now: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }
}

/// Decoded ARP packet (Ethernet + IPv4 only)
#[derive(Debug, Clone, Copy)]
struct ArpPacket {
    op: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
}

impl ArpPacket {
    fn parse(data: &[u8]) -> KernelResult<ArpPacket> {
        let mut r = ByteReader::new(data);
        let htype = r.read_u16()?;
        let ptype = r.read_u16()?;
        let hlen = r.read_u8()?;
        let plen = r.read_u8()?;
        if htype != ARP_HTYPE_ETHERNET || ptype != ETH_P_IPV4 || hlen != 6 || plen != 4 {
            return Err(KernelError::ProtocolError);
        }
        let op = r.read_u16()?;
        let sender_mac = MacAddr(r.read_array::<6>()?);
        let sender_ip = Ipv4Addr::from(r.read_array::<4>()?);
        let target_mac = MacAddr(r.read_array::<6>()?);
        let target_ip = Ipv4Addr::from(r.read_array::<4>()?);
        Ok(ArpPacket { op, sender_mac, sender_ip, target_mac, target_ip })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(28);
        w.write_u16(ARP_HTYPE_ETHERNET);
        w.write_u16(ETH_P_IPV4);
        w.write_u8(6);
        w.write_u8(4);
        w.write_u16(self.op);
        w.write_slice(self.sender_mac.as_bytes());
        w.write_slice(&self.sender_ip.octets());
        w.write_slice(self.target_mac.as_bytes());
        w.write_slice(&self.target_ip.octets());
        w.into_vec()
    }

    /// Request where sender and target protocol address match
    fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }
}

impl NetStack {
    /// Look up a complete, unexpired binding
    pub fn arp_lookup(&self, ip: Ipv4Addr) -> KernelResult<MacAddr> {
        let now = self.clock.now();
        let cache = self.arp.lock().unwrap();
        cache
            .get_valid(ip, now)
            .map(|e| e.mac)
            .ok_or(KernelError::NotFound)
    }

    /// Administratively insert a binding
    pub fn arp_add(&self, ip: Ipv4Addr, mac: MacAddr, permanent: bool) {
        let now = self.clock.now();
        let flags = if permanent { ATF_PERMANENT } else { 0 };
        let flushed = self.arp.lock().unwrap().insert(ip, mac, flags, now);
        self.flush_arp_pending(mac, flushed);
    }

    /// Remove a binding
    pub fn arp_del(&self, ip: Ipv4Addr) -> KernelResult<()> {
        self.arp
            .lock()
            .unwrap()
            .entries
            .remove(&ip)
            .map(|_| ())
            .ok_or(KernelError::NotFound)
    }

    /// Resolve `next_hop` for a packet about to leave `ifindex`
    ///
    /// On a miss the packet is parked on an incomplete entry and a
    /// broadcast request goes out; the caller sees `WouldBlock` as the
    /// pending indication.
    pub(crate) fn arp_resolve(
        &self,
        ifindex: u32,
        next_hop: Ipv4Addr,
        pkt: PacketBuffer,
    ) -> KernelResult<(MacAddr, PacketBuffer)> {
        let now = self.clock.now();
        {
            let mut cache = self.arp.lock().unwrap();
            if let Some(entry) = cache.get_valid(next_hop, now) {
                return Ok((entry.mac, pkt));
            }

            // Park the packet on an incomplete entry.
            let entry = cache.entries.entry(next_hop).or_insert_with(|| ArpEntry {
                ip: next_hop,
                mac: MacAddr::ZERO,
                flags: 0,
                created: now,
                pending: Vec::new(),
            });
            if entry.pending.len() < ARP_PENDING_MAX {
                entry.pending.push((ifindex, pkt));
            } else {
                self.stats.ip_out_dropped.inc();
            }
        }

        self.arp_send_request(ifindex, next_hop)?;
        Err(KernelError::WouldBlock)
    }

    fn arp_send_request(&self, ifindex: u32, target_ip: Ipv4Addr) -> KernelResult<()> {
        let iface = self.iface_by_index(ifindex).ok_or(KernelError::NotFound)?;
        let sender_ip = iface.addr().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let req = ArpPacket {
            op: ARP_OP_REQUEST,
            sender_mac: iface.mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        };
        let body = req.encode();
        let mut pkt = PacketBuffer::with_headroom(body.len() + 14, 14)?;
        pkt.put(&body)?;
        log::trace!("{}: who-has {} tell {}", iface.name, target_ip, sender_ip);
        self.ether_output(ifindex, MacAddr::BROADCAST, ETH_P_ARP, pkt)
    }

    /// Handle a received ARP packet
    pub(crate) fn arp_input(&self, ifindex: u32, pkt: PacketBuffer) {
        let arp = match ArpPacket::parse(pkt.data()) {
            Ok(p) => p,
            Err(_) => {
                self.stats.arp_errors.inc();
                return;
            }
        };

        let iface = match self.iface_by_index(ifindex) {
            Some(i) => i,
            None => return,
        };
        let our_ip = iface.addr();

        // A frame claiming our own address is somebody else's problem
        // (or an address conflict worth logging).
        if our_ip.is_some() && Some(arp.sender_ip) == our_ip {
            log::warn!("{}: duplicate address {} from {}", iface.name, arp.sender_ip, arp.sender_mac);
            self.stats.arp_errors.inc();
            return;
        }

        let now = self.clock.now();

        // Gratuitous ARP only refreshes existing bindings.
        if arp.is_gratuitous() {
            let mut cache = self.arp.lock().unwrap();
            if cache.entries.contains_key(&arp.sender_ip) {
                let flushed = cache.insert(arp.sender_ip, arp.sender_mac, 0, now);
                drop(cache);
                self.flush_arp_pending(arp.sender_mac, flushed);
            }
            return;
        }

        match arp.op {
            ARP_OP_REQUEST => {
                // Learn the sender, then reply if they ask about us.
                let flushed = self
                    .arp
                    .lock()
                    .unwrap()
                    .insert(arp.sender_ip, arp.sender_mac, 0, now);
                self.flush_arp_pending(arp.sender_mac, flushed);

                if our_ip == Some(arp.target_ip) {
                    let reply = ArpPacket {
                        op: ARP_OP_REPLY,
                        sender_mac: iface.mac,
                        sender_ip: arp.target_ip,
                        target_mac: arp.sender_mac,
                        target_ip: arp.sender_ip,
                    };
                    let body = reply.encode();
                    let mut out = match PacketBuffer::with_headroom(body.len() + 14, 14) {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    if out.put(&body).is_err() {
                        return;
                    }
                    let _ = self.ether_output(ifindex, arp.sender_mac, ETH_P_ARP, out);
                }
            }
            ARP_OP_REPLY => {
                let flushed = self
                    .arp
                    .lock()
                    .unwrap()
                    .insert(arp.sender_ip, arp.sender_mac, 0, now);
                self.flush_arp_pending(arp.sender_mac, flushed);
            }
            _ => self.stats.arp_errors.inc(),
        }
    }

    /// Transmit packets that were parked waiting for a binding
    fn flush_arp_pending(&self, mac: MacAddr, pending: Vec<(u32, PacketBuffer)>) {
        for (ifindex, parked) in pending {
            let _ = self.ether_output(ifindex, mac, ETH_P_IPV4, parked);
        }
    }

    /// Periodic expiry pass
    pub(crate) fn arp_sweep(&self, now: Duration) {
        let expired = self.arp.lock().unwrap().expire(now);
        if expired > 0 {
            log::trace!("arp: expired {} entries", expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::stack_with_iface;

    #[test]
    fn test_lookup_and_expiry() {
        let (stack, _idx) = stack_with_iface("192.168.1.1");
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        let mac = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

        stack.arp_add(ip, mac, false);
        assert_eq!(stack.arp_lookup(ip), Ok(mac));

        // 301 seconds of silence expires the binding.
        stack.clock.advance(Duration::from_secs(301));
        assert_eq!(stack.arp_lookup(ip), Err(KernelError::NotFound));

        stack.arp_sweep(stack.clock.now());
        assert!(stack.arp.lock().unwrap().is_empty());
    }

    #[test]
    fn test_permanent_survives_expiry() {
        let (stack, _idx) = stack_with_iface("192.168.1.1");
        let ip = Ipv4Addr::new(192, 168, 1, 3);
        stack.arp_add(ip, MacAddr([1, 2, 3, 4, 5, 6]), true);

        stack.clock.advance(Duration::from_secs(3600));
        stack.arp_sweep(stack.clock.now());
        assert!(stack.arp_lookup(ip).is_ok());
    }

    #[test]
    fn test_eviction_when_full() {
        let (stack, _idx) = stack_with_iface("10.0.0.1");
        for i in 0..ARP_CACHE_MAX as u32 {
            let ip = Ipv4Addr::from(0x0a00_0100u32 + i);
            stack.arp_add(ip, MacAddr([0, 0, 0, 0, 0, 1]), false);
            stack.clock.advance(Duration::from_millis(1));
        }
        assert_eq!(stack.arp.lock().unwrap().len(), ARP_CACHE_MAX);

        // One more insert evicts the oldest entry.
        stack.arp_add(Ipv4Addr::new(10, 9, 9, 9), MacAddr([9; 6]), false);
        let cache = stack.arp.lock().unwrap();
        assert_eq!(cache.len(), ARP_CACHE_MAX);
        assert!(cache.entries.contains_key(&Ipv4Addr::new(10, 9, 9, 9)));
        assert!(!cache.entries.contains_key(&Ipv4Addr::from(0x0a00_0100u32)));
    }

    #[test]
    fn test_request_learns_and_replies() {
        let (stack, idx) = stack_with_iface("192.168.1.1");
        let req = ArpPacket {
            op: ARP_OP_REQUEST,
            sender_mac: MacAddr([2, 2, 2, 2, 2, 2]),
            sender_ip: Ipv4Addr::new(192, 168, 1, 50),
            target_mac: MacAddr::ZERO,
            target_ip: Ipv4Addr::new(192, 168, 1, 1),
        };
        let mut pkt = PacketBuffer::from_slice(&req.encode());
        pkt.ingress = Some(idx);
        stack.arp_input(idx, pkt);

        // Sender was learned.
        assert_eq!(
            stack.arp_lookup(Ipv4Addr::new(192, 168, 1, 50)),
            Ok(MacAddr([2, 2, 2, 2, 2, 2]))
        );
    }

    #[test]
    fn test_bad_packet_rejected() {
        let (stack, idx) = stack_with_iface("192.168.1.1");
        let before = stack.stats.arp_errors.get();
        // htype 2 is not Ethernet.
        let mut bad = ArpPacket {
            op: ARP_OP_REQUEST,
            sender_mac: MacAddr([2; 6]),
            sender_ip: Ipv4Addr::new(1, 1, 1, 1),
            target_mac: MacAddr::ZERO,
            target_ip: Ipv4Addr::new(2, 2, 2, 2),
        }
        .encode();
        bad[0] = 0;
        bad[1] = 2;
        stack.arp_input(idx, PacketBuffer::from_slice(&bad));
        assert_eq!(stack.stats.arp_errors.get(), before + 1);
    }
}
