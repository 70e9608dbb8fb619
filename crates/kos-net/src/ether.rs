//! Ethernet framing and demultiplexing
//!
//! Validates the 14-byte link header and dispatches by EtherType. VLAN
//! tags are stripped and re-dispatched on the matching sub-interface.

use kos_core::bytes::{ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::{Layer, PacketBuffer};

use crate::NetStack;

/// Length of an Ethernet header
pub const ETH_HLEN: usize = 14;

/// EtherType values the stack dispatches on
pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_VLAN: u16 = 0x8100;
pub const ETH_P_IPV6: u16 = 0x86DD;

/// A 48-bit hardware address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    /// Group bit of the first octet
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

/// Decoded Ethernet header
#[derive(Debug, Clone, Copy)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthHeader {
    /// Parse the leading 14 bytes of a frame
    pub fn parse(frame: &[u8]) -> KernelResult<EthHeader> {
        let mut r = ByteReader::new(frame);
        let dst = MacAddr(r.read_array::<6>()?);
        let src = MacAddr(r.read_array::<6>()?);
        let ethertype = r.read_u16()?;
        Ok(EthHeader { dst, src, ethertype })
    }

    /// Encode into wire form
    pub fn encode(&self) -> [u8; ETH_HLEN] {
        let mut w = ByteWriter::with_capacity(ETH_HLEN);
        w.write_slice(self.dst.as_bytes());
        w.write_slice(self.src.as_bytes());
        w.write_u16(self.ethertype);
        let mut out = [0u8; ETH_HLEN];
        out.copy_from_slice(w.bytes());
        out
    }
}

impl NetStack {
    /// Entry point for inbound frames
    ///
    /// Drivers (and tests) feed received frames here. The packet must
    /// contain the full Ethernet frame starting at its head.
    pub fn input(&self, ifindex: u32, mut pkt: PacketBuffer) {
        let iface = match self.iface_by_index(ifindex) {
            Some(i) => i,
            None => {
                log::debug!("input on unknown interface {}", ifindex);
                return;
            }
        };

        pkt.ingress = Some(ifindex);
        pkt.timestamp = self.clock.now();
        pkt.mark_layer(Layer::L2);

        iface.rx.account(pkt.len());

        let hdr = match EthHeader::parse(pkt.data()) {
            Ok(h) => h,
            Err(_) => {
                iface.rx.errors.inc();
                return;
            }
        };

        // A frame must never carry a group or all-zero source address.
        if hdr.src.is_zero() || hdr.src.is_multicast() {
            iface.rx.errors.inc();
            return;
        }

        // Deliver broadcast/multicast and our own unicast; everything
        // else is dropped, there is no L2 forwarding.
        if !hdr.dst.is_broadcast() && !hdr.dst.is_multicast() && hdr.dst != iface.mac {
            iface.rx.dropped.inc();
            return;
        }

        if pkt.pull(ETH_HLEN).is_err() {
            iface.rx.errors.inc();
            return;
        }

        self.eth_dispatch(ifindex, hdr.ethertype, hdr, pkt);
    }

    fn eth_dispatch(&self, ifindex: u32, ethertype: u16, hdr: EthHeader, mut pkt: PacketBuffer) {
        match ethertype {
            ETH_P_IPV4 => self.ip_input(ifindex, pkt),
            ETH_P_ARP => self.arp_input(ifindex, pkt),
            ETH_P_IPV6 => self.ip6_input(ifindex, hdr, pkt),
            ETH_P_VLAN => self.vlan_input(ifindex, hdr, &mut pkt),
            other => {
                log::trace!("dropping frame with unknown ethertype {:#06x}", other);
                if let Some(iface) = self.iface_by_index(ifindex) {
                    iface.rx.dropped.inc();
                }
            }
        }
    }

    /// Strip a 802.1Q tag and re-dispatch on the VLAN sub-interface
    fn vlan_input(&self, ifindex: u32, hdr: EthHeader, pkt: &mut PacketBuffer) {
        let (vid, inner_type) = {
            let mut r = ByteReader::new(pkt.data());
            let tci = match r.read_u16() {
                Ok(v) => v,
                Err(_) => return,
            };
            let inner = match r.read_u16() {
                Ok(v) => v,
                Err(_) => return,
            };
            (tci & 0x0FFF, inner)
        };

        // VID 0 is priority-only, 4095 is reserved.
        if vid == 0 || vid == 4095 {
            if let Some(iface) = self.iface_by_index(ifindex) {
                iface.rx.dropped.inc();
            }
            return;
        }

        let sub = match self.vlan_sub_iface(ifindex, vid) {
            Some(idx) => idx,
            None => {
                log::trace!("no sub-interface for VLAN {} on iface {}", vid, ifindex);
                if let Some(iface) = self.iface_by_index(ifindex) {
                    iface.rx.dropped.inc();
                }
                return;
            }
        };

        let mut inner = PacketBuffer::from_slice(&pkt.data()[4..]);
        inner.ingress = Some(sub);
        inner.timestamp = pkt.timestamp;
        self.eth_dispatch(sub, inner_type, hdr, inner);
    }

    /// Frame a packet and hand it to the egress interface
    ///
    /// No stack locks are held when the driver callback runs, so drivers
    /// are free to call back into the stack (loopback, test harnesses).
    pub(crate) fn ether_output(
        &self,
        ifindex: u32,
        dst: MacAddr,
        ethertype: u16,
        mut pkt: PacketBuffer,
    ) -> KernelResult<()> {
        let iface = self.iface_by_index(ifindex).ok_or(KernelError::NotFound)?;

        let hdr = EthHeader { dst, src: iface.mac, ethertype };
        let buf = pkt.push(ETH_HLEN)?;
        buf.copy_from_slice(&hdr.encode());
        pkt.mark_layer(Layer::L2);

        iface.tx.account(pkt.len());

        if iface.is_loopback() {
            // Loopback frames re-enter the input path directly.
            self.input(ifindex, pkt);
            return Ok(());
        }

        match iface.driver() {
            Some(driver) => {
                driver.send(&iface, pkt);
                Ok(())
            }
            None => {
                // No hardware behind this interface: account and release.
                iface.tx.dropped.inc();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display() {
        let mac = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(format!("{}", mac), "00:11:22:33:44:55");
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr([0x01, 0, 0, 0, 0, 0]).is_multicast());
    }

    #[test]
    fn test_eth_header_round_trip() {
        let hdr = EthHeader {
            dst: MacAddr::BROADCAST,
            src: MacAddr([2, 4, 6, 8, 10, 12]),
            ethertype: ETH_P_ARP,
        };
        let wire = hdr.encode();
        let back = EthHeader::parse(&wire).unwrap();
        assert_eq!(back.dst, hdr.dst);
        assert_eq!(back.src, hdr.src);
        assert_eq!(back.ethertype, ETH_P_ARP);
    }

    #[test]
    fn test_eth_header_too_short() {
        assert!(EthHeader::parse(&[0u8; 13]).is_err());
    }
}
