//! Network interfaces and the link I/O boundary
//!
//! Real device drivers are out of scope; a `LinkDriver` is the callback
//! seam where frames leave the stack. Interfaces without a driver count
//! the frame and release it, which is all the test paths need.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::PacketBuffer;
use kos_core::stats::DirStats;

use crate::ether::MacAddr;
use crate::NetStack;

/// Interface flag bits
pub const IFF_UP: u32 = 0x1;
pub const IFF_BROADCAST: u32 = 0x2;
pub const IFF_LOOPBACK: u32 = 0x8;
pub const IFF_RUNNING: u32 = 0x40;

/// Longest accepted interface name
pub const IFNAMSIZ: usize = 15;

/// Outbound frame sink for one interface
///
/// `send` takes ownership of the fully framed packet. Implementations
/// may re-enter the stack (no stack locks are held at the call site).
pub trait LinkDriver: Send + Sync {
    fn send(&self, iface: &NetInterface, frame: PacketBuffer);

    /// Device-specific control operation
    fn ioctl(&self, _iface: &NetInterface, _cmd: u32, _arg: u32) -> KernelResult<u32> {
        Err(KernelError::InvalidArgument)
    }
}

/// Runtime-configurable IPv4 addressing of an interface
#[derive(Debug, Clone, Copy, Default)]
struct IfaceAddrs {
    addr: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
    broadcast: Option<Ipv4Addr>,
}

/// A network interface
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub mtu: usize,

    flags: AtomicU32,
    addrs: Mutex<IfaceAddrs>,
    driver: Mutex<Option<Arc<dyn LinkDriver>>>,

    /// VLAN id when this is a sub-interface of another port
    pub vlan: Option<(u32, u16)>,

    pub rx: DirStats,
    pub tx: DirStats,
}

impl NetInterface {
    fn new(name: &str, index: u32, mac: MacAddr, mtu: usize, flags: u32) -> KernelResult<Self> {
        if name.is_empty() || name.len() > IFNAMSIZ {
            return Err(KernelError::InvalidArgument);
        }
        if mtu < 68 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(NetInterface {
            name: name.to_string(),
            index,
            mac,
            mtu,
            flags: AtomicU32::new(flags),
            addrs: Mutex::new(IfaceAddrs::default()),
            driver: Mutex::new(None),
            vlan: None,
            rx: DirStats::new(),
            tx: DirStats::new(),
        })
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.flags() & IFF_UP != 0
    }

    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.flags() & IFF_LOOPBACK != 0
    }

    pub fn set_flags(&self, set: u32, clear: u32) {
        let mut cur = self.flags.load(Ordering::Acquire);
        loop {
            let next = (cur | set) & !clear;
            match self.flags.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Assign an IPv4 address and netmask; the broadcast address is
    /// derived from them
    pub fn configure(&self, addr: Ipv4Addr, netmask: Ipv4Addr) {
        let bcast = Ipv4Addr::from(u32::from(addr) | !u32::from(netmask));
        let mut a = self.addrs.lock().unwrap();
        a.addr = Some(addr);
        a.netmask = Some(netmask);
        a.broadcast = Some(bcast);
        log::debug!("{}: configured {} netmask {}", self.name, addr, netmask);
    }

    /// Drop the IPv4 configuration (lease released or expired)
    pub fn deconfigure(&self) {
        let mut a = self.addrs.lock().unwrap();
        *a = IfaceAddrs::default();
    }

    pub fn addr(&self) -> Option<Ipv4Addr> {
        self.addrs.lock().unwrap().addr
    }

    pub fn netmask(&self) -> Option<Ipv4Addr> {
        self.addrs.lock().unwrap().netmask
    }

    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        self.addrs.lock().unwrap().broadcast
    }

    /// True if `ip` is this interface's unicast or broadcast address
    pub fn owns_addr(&self, ip: Ipv4Addr) -> bool {
        let a = self.addrs.lock().unwrap();
        a.addr == Some(ip) || a.broadcast == Some(ip)
    }

    pub fn set_driver(&self, driver: Arc<dyn LinkDriver>) {
        *self.driver.lock().unwrap() = Some(driver);
    }

    pub(crate) fn driver(&self) -> Option<Arc<dyn LinkDriver>> {
        self.driver.lock().unwrap().clone()
    }

    /// Forward a control operation to the driver
    pub fn ioctl(&self, cmd: u32, arg: u32) -> KernelResult<u32> {
        match self.driver() {
            Some(d) => d.ioctl(self, cmd, arg),
            None => Err(KernelError::NotFound),
        }
    }
}

impl NetStack {
    /// Create an interface and return its index
    pub fn iface_add(&self, name: &str, mac: MacAddr, mtu: usize) -> KernelResult<u32> {
        let mut ifaces = self.ifaces.write().unwrap();
        let index = self.next_ifindex.fetch_add(1, Ordering::Relaxed);
        let iface = NetInterface::new(name, index, mac, mtu, IFF_BROADCAST)?;
        ifaces.push(Arc::new(iface));
        log::debug!("registered interface {} ({})", name, index);
        Ok(index)
    }

    /// Create the loopback interface (up immediately, 127.0.0.1/8)
    pub fn iface_add_loopback(&self) -> KernelResult<u32> {
        let mut ifaces = self.ifaces.write().unwrap();
        let index = self.next_ifindex.fetch_add(1, Ordering::Relaxed);
        let iface = NetInterface::new(
            "lo",
            index,
            MacAddr::ZERO,
            65535,
            IFF_UP | IFF_LOOPBACK | IFF_RUNNING,
        )?;
        iface.configure(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0));
        ifaces.push(Arc::new(iface));
        Ok(index)
    }

    /// Create a VLAN sub-interface of an existing port
    pub fn iface_add_vlan(&self, parent: u32, vid: u16) -> KernelResult<u32> {
        if vid == 0 || vid >= 4095 {
            return Err(KernelError::InvalidArgument);
        }
        let (name, mac, mtu) = {
            let parent_iface = self.iface_by_index(parent).ok_or(KernelError::NotFound)?;
            (
                format!("{}.{}", parent_iface.name, vid),
                parent_iface.mac,
                parent_iface.mtu,
            )
        };
        if name.len() > IFNAMSIZ {
            return Err(KernelError::InvalidArgument);
        }
        let mut ifaces = self.ifaces.write().unwrap();
        let index = self.next_ifindex.fetch_add(1, Ordering::Relaxed);
        let mut iface = NetInterface::new(&name, index, mac, mtu, IFF_BROADCAST)?;
        iface.vlan = Some((parent, vid));
        ifaces.push(Arc::new(iface));
        Ok(index)
    }

    /// Remove an interface; routes referencing it are purged
    pub fn iface_remove(&self, index: u32) -> KernelResult<()> {
        {
            let mut ifaces = self.ifaces.write().unwrap();
            let pos = ifaces
                .iter()
                .position(|i| i.index == index)
                .ok_or(KernelError::NotFound)?;
            ifaces.remove(pos);
        }
        self.routes.lock().unwrap().purge_iface(index);
        Ok(())
    }

    pub fn iface_by_index(&self, index: u32) -> Option<Arc<NetInterface>> {
        self.ifaces
            .read()
            .unwrap()
            .iter()
            .find(|i| i.index == index)
            .cloned()
    }

    pub fn iface_by_name(&self, name: &str) -> Option<Arc<NetInterface>> {
        self.ifaces
            .read()
            .unwrap()
            .iter()
            .find(|i| i.name == name)
            .cloned()
    }

    /// Bring an interface up
    pub fn iface_up(&self, index: u32) -> KernelResult<()> {
        let iface = self.iface_by_index(index).ok_or(KernelError::NotFound)?;
        iface.set_flags(IFF_UP | IFF_RUNNING, 0);
        Ok(())
    }

    pub fn iface_down(&self, index: u32) -> KernelResult<()> {
        let iface = self.iface_by_index(index).ok_or(KernelError::NotFound)?;
        iface.set_flags(0, IFF_UP | IFF_RUNNING);
        Ok(())
    }

    /// Find the VLAN sub-interface of `parent` carrying `vid`
    pub(crate) fn vlan_sub_iface(&self, parent: u32, vid: u16) -> Option<u32> {
        self.ifaces
            .read()
            .unwrap()
            .iter()
            .find(|i| i.vlan == Some((parent, vid)))
            .map(|i| i.index)
    }

    /// True if `ip` belongs to any local interface (unicast or broadcast)
    pub(crate) fn is_local_addr(&self, ip: Ipv4Addr) -> bool {
        if ip == Ipv4Addr::BROADCAST {
            return true;
        }
        self.ifaces.read().unwrap().iter().any(|i| i.owns_addr(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetStack;
    use kos_core::clock::Clock;

    #[test]
    fn test_iface_add_and_configure() {
        let stack = NetStack::new(Arc::new(Clock::manual()));
        let idx = stack
            .iface_add("eth0", MacAddr([2, 0, 0, 0, 0, 1]), 1500)
            .unwrap();
        let iface = stack.iface_by_index(idx).unwrap();

        assert!(!iface.is_up());
        stack.iface_up(idx).unwrap();
        assert!(iface.is_up());

        iface.configure(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(iface.broadcast(), Some(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(iface.owns_addr(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(iface.owns_addr(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!iface.owns_addr(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn test_iface_name_limit() {
        let stack = NetStack::new(Arc::new(Clock::manual()));
        let err = stack.iface_add("averylonginterfacename", MacAddr::ZERO, 1500);
        assert_eq!(err, Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_vlan_sub_iface_lookup() {
        let stack = NetStack::new(Arc::new(Clock::manual()));
        let parent = stack
            .iface_add("eth0", MacAddr([2, 0, 0, 0, 0, 1]), 1500)
            .unwrap();
        let sub = stack.iface_add_vlan(parent, 100).unwrap();

        assert_eq!(stack.vlan_sub_iface(parent, 100), Some(sub));
        assert_eq!(stack.vlan_sub_iface(parent, 101), None);
        assert!(stack.iface_add_vlan(parent, 4095).is_err());
    }
}
