//! # kos-net
//!
//! The network stack core: a layered packet pipeline (link → IP →
//! UDP/TCP) with connection state machines, fragmentation/reassembly,
//! ARP/DHCP/DNS auxiliary protocols, netfilter hooks, connection
//! tracking and routing. Everything hangs off one owned [`NetStack`]
//! value; there are no process-wide globals.
//!
//! ## Modules
//!
//! - `ether` - Ethernet framing, demux, VLAN handling
//! - `iface` - interfaces and the link driver boundary
//! - `arp` - address resolution cache and protocol
//! - `route` - longest-prefix routing table
//! - `ip` - IPv4 input/forward/output and fragmentation
//! - `reassembly` - hole-descriptor fragment reassembly
//! - `icmp` - echo and error messages, skeletal ICMPv6 echo
//! - `tcp` - connection state machines, congestion control
//! - `udp` - datagram transport
//! - `socket` - the socket API façade
//! - `dns` - stub resolver and cache
//! - `dhcp` - per-interface lease client
//! - `netfilter` - hook points and verdicts
//! - `conntrack` - flow tracking at PRE_ROUTING
//!
//! ## Locking
//!
//! Lock order is global registries → per-protocol tables → per-socket
//! state → queues. No lock is ever held across a driver callback or a
//! blocking wait; socket calls that cannot progress return `WouldBlock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use kos_core::clock::Clock;
use kos_core::stats::Counter;
use kos_core::timer::TimerSweep;

pub mod arp;
pub mod conntrack;
pub mod dhcp;
pub mod dns;
pub mod ether;
pub mod icmp;
pub mod iface;
pub mod ip;
pub mod netfilter;
pub mod reassembly;
pub mod route;
pub mod socket;
pub mod tcp;
pub mod udp;

// Re-exports for convenience
pub use conntrack::{ConnTrack, CtKey, CtState};
pub use ether::MacAddr;
pub use iface::{LinkDriver, NetInterface};
pub use netfilter::{Hook, NetfilterHandler, PacketMeta, Verdict};
pub use route::Route;
pub use socket::{OptVal, Socket, SocketState};
pub use tcp::tcb::TcpState;

use arp::ArpCache;
use conntrack::ConntrackHook;
use dhcp::DhcpClient;
use dns::DnsResolver;
use netfilter::Netfilter;
use reassembly::ReassemblyTable;
use route::RouteTable;
use socket::SocketTable;
use tcp::TcpRegistry;
use udp::UdpRegistry;

/// Advisory counters for the whole stack
#[derive(Debug, Default)]
pub struct NetStats {
    pub ip_in: Counter,
    pub ip_in_errors: Counter,
    pub ip_in_dropped: Counter,
    pub ip_out: Counter,
    pub ip_out_errors: Counter,
    pub ip_out_dropped: Counter,
    pub ip_forwarded: Counter,
    pub ip_forward_errors: Counter,
    pub ip_frags_created: Counter,
    pub ip_reasm_ok: Counter,
    pub ip_reasm_fails: Counter,

    pub icmp_in: Counter,
    pub icmp_in_errors: Counter,
    pub icmp_out: Counter,

    pub tcp_in: Counter,
    pub tcp_in_errors: Counter,
    pub tcp_out: Counter,
    pub tcp_active_opens: Counter,
    pub tcp_passive_opens: Counter,
    pub tcp_established: Counter,
    pub tcp_refused: Counter,
    pub tcp_resets: Counter,
    pub tcp_retransmits: Counter,
    pub tcp_fast_retransmits: Counter,
    pub tcp_rtx_failures: Counter,
    pub tcp_ooo_drops: Counter,
    pub tcp_rcv_drops: Counter,

    pub udp_in: Counter,
    pub udp_in_errors: Counter,
    pub udp_in_dropped: Counter,
    pub udp_out: Counter,
    pub udp_no_port: Counter,

    pub arp_errors: Counter,

    pub dns_queries: Counter,
    pub dns_cache_hits: Counter,

    pub dhcp_out: Counter,
    pub dhcp_errors: Counter,
}

/// The network stack
///
/// One value owns every table and registry; subsystems lock what they
/// need and nothing else. Construct with [`NetStack::new`], register
/// interfaces and routes, then feed frames through [`NetStack::input`].
pub struct NetStack {
    pub clock: Arc<Clock>,

    pub(crate) ifaces: RwLock<Vec<Arc<NetInterface>>>,
    pub(crate) next_ifindex: AtomicU32,

    pub(crate) routes: Mutex<RouteTable>,
    pub(crate) arp: Mutex<ArpCache>,
    pub(crate) reasm: Mutex<ReassemblyTable>,

    pub(crate) tcp: Mutex<TcpRegistry>,
    pub(crate) udp: Mutex<UdpRegistry>,
    pub(crate) sockets: RwLock<SocketTable>,
    pub(crate) next_sock: AtomicU32,

    pub(crate) netfilter: Netfilter,
    pub(crate) conntrack: Arc<Mutex<ConnTrack>>,

    pub(crate) dns: Mutex<DnsResolver>,
    pub(crate) dhcp: Mutex<HashMap<u32, DhcpClient>>,

    pub(crate) ip_ident: AtomicU16,
    forwarding: AtomicBool,

    pub stats: NetStats,
}

impl NetStack {
    /// Create a stack; connection tracking is wired into PRE_ROUTING
    pub fn new(clock: Arc<Clock>) -> Self {
        let conntrack = Arc::new(Mutex::new(ConnTrack::new()));
        let stack = NetStack {
            clock: clock.clone(),
            ifaces: RwLock::new(Vec::new()),
            next_ifindex: AtomicU32::new(0),
            routes: Mutex::new(RouteTable::default()),
            arp: Mutex::new(ArpCache::default()),
            reasm: Mutex::new(ReassemblyTable::default()),
            tcp: Mutex::new(TcpRegistry::default()),
            udp: Mutex::new(UdpRegistry::default()),
            sockets: RwLock::new(SocketTable::new()),
            next_sock: AtomicU32::new(0),
            netfilter: Netfilter::new(),
            conntrack: conntrack.clone(),
            dns: Mutex::new(DnsResolver::new()),
            dhcp: Mutex::new(HashMap::new()),
            ip_ident: AtomicU16::new(1),
            forwarding: AtomicBool::new(true),
            stats: NetStats::default(),
        };

        // Track inbound flows at PRE_ROUTING and our own at LOCAL_OUT so
        // locally originated connections graduate too.
        let hook = Arc::new(ConntrackHook::new(conntrack, clock));
        stack
            .netfilter
            .register(Hook::PreRouting, -200, hook.clone())
            .expect("fresh netfilter chain");
        stack
            .netfilter
            .register(Hook::LocalOut, -200, hook)
            .expect("fresh netfilter chain");
        stack
    }

    /// Enable or disable IPv4 forwarding
    pub fn set_forwarding(&self, enabled: bool) {
        self.forwarding.store(enabled, Ordering::Release);
    }

    pub(crate) fn forwarding_enabled(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    /// Shut the stack down: close every socket, drop tables
    ///
    /// Deterministic teardown; the owning kernel stops the timer worker
    /// before calling this, so no sweep runs concurrently.
    pub fn shutdown(&self) {
        let ids: Vec<_> = self.sockets.read().unwrap().keys().copied().collect();
        for id in ids {
            let _ = self.close(id);
        }
        self.sockets.write().unwrap().clear();
        self.tcp.lock().unwrap().conns.clear();
        self.tcp.lock().unwrap().listeners.clear();
        self.udp.lock().unwrap().bound.clear();
        self.dhcp.lock().unwrap().clear();
        self.ifaces.write().unwrap().clear();
        log::debug!("network stack shut down");
    }

    /// The periodic maintenance passes, for the kernel's timer worker
    pub fn sweeps(self: &Arc<Self>) -> Vec<Arc<dyn TimerSweep>> {
        let sweep = |name, run: fn(&NetStack, Duration)| -> Arc<dyn TimerSweep> {
            Arc::new(NetSweep { name, stack: self.clone(), run })
        };
        vec![
            sweep("tcp-timers", |s, now| s.tcp_sweep(now)),
            sweep("conntrack", |s, now| s.conntrack_sweep(now)),
            sweep("arp", |s, now| s.arp_sweep(now)),
            sweep("ip-reassembly", |s, now| s.ip_sweep(now)),
            sweep("dns-cache", |s, now| s.dns_sweep(now)),
            sweep("dhcp", |s, now| s.dhcp_sweep(now)),
            sweep("route-gc", |s, _| s.route_sweep()),
        ]
    }

    /// Run every maintenance pass once at the current clock time
    ///
    /// Tests drive expiry with this instead of the worker thread.
    pub fn sweep_now(&self) {
        let now = self.clock.now();
        self.tcp_sweep(now);
        self.conntrack_sweep(now);
        self.arp_sweep(now);
        self.ip_sweep(now);
        self.dns_sweep(now);
        self.dhcp_sweep(now);
        self.route_sweep();
    }
}

/// Adapter binding one stack maintenance pass to the timer worker
struct NetSweep {
    name: &'static str,
    stack: Arc<NetStack>,
    run: fn(&NetStack, Duration),
}

impl TimerSweep for NetSweep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn sweep(&self, now: Duration) {
        (self.run)(&self.stack, now);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures: configured stacks and a synchronous wire
    //! between two of them.

    use super::*;
    use crate::ether::MacAddr;
    use crate::iface::LinkDriver;
    use kos_core::pktbuf::PacketBuffer;
    use std::net::Ipv4Addr;
    use std::sync::OnceLock;

    /// Stack with one configured interface (`addr`/24, up)
    pub(crate) fn stack_with_iface(addr: &str) -> (Arc<NetStack>, u32) {
        let stack = Arc::new(NetStack::new(Arc::new(Clock::manual())));
        let idx = stack
            .iface_add("eth0", MacAddr([0x02, 0, 0, 0, 0, 0x01]), 1500)
            .unwrap();
        stack.iface_up(idx).unwrap();
        let ip: Ipv4Addr = addr.parse().unwrap();
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        stack.iface_by_index(idx).unwrap().configure(ip, mask);
        let net = Ipv4Addr::from(u32::from(ip) & u32::from(mask));
        stack.route_add(net, mask, None, idx, 0, 0).unwrap();
        (stack, idx)
    }

    /// Stack with one up but unconfigured interface (DHCP fixtures)
    pub(crate) fn stack_with_iface_unconfigured() -> (Arc<NetStack>, u32) {
        let stack = Arc::new(NetStack::new(Arc::new(Clock::manual())));
        let idx = stack
            .iface_add("eth0", MacAddr([0x02, 0, 0, 0, 0, 0x02]), 1500)
            .unwrap();
        stack.iface_up(idx).unwrap();
        (stack, idx)
    }

    /// One endpoint of a wired stack pair
    pub(crate) struct TestHost {
        pub stack: Arc<NetStack>,
        pub ifindex: u32,
        pub addr: Ipv4Addr,
    }

    /// Synchronous wire: frames sent on one stack arrive on the other
    /// before `send` returns
    struct PipeDriver {
        peer: OnceLock<(Arc<NetStack>, u32)>,
    }

    impl LinkDriver for PipeDriver {
        fn send(&self, _iface: &NetInterface, frame: PacketBuffer) {
            if let Some((stack, ifindex)) = self.peer.get() {
                stack.input(*ifindex, PacketBuffer::from_slice(frame.data()));
            }
        }
    }

    /// Two stacks on 10.0.0.1 and 10.0.0.2 joined by a synchronous link
    pub(crate) fn stack_pair_link() -> (TestHost, TestHost) {
        let a = Arc::new(NetStack::new(Arc::new(Clock::manual())));
        let b = Arc::new(NetStack::new(Arc::new(Clock::manual())));

        let ia = a
            .iface_add("eth0", MacAddr([0x02, 0, 0, 0, 0, 0xA1]), 1500)
            .unwrap();
        let ib = b
            .iface_add("eth0", MacAddr([0x02, 0, 0, 0, 0, 0xB1]), 1500)
            .unwrap();
        a.iface_up(ia).unwrap();
        b.iface_up(ib).unwrap();

        let addr_a = Ipv4Addr::new(10, 0, 0, 1);
        let addr_b = Ipv4Addr::new(10, 0, 0, 2);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        a.iface_by_index(ia).unwrap().configure(addr_a, mask);
        b.iface_by_index(ib).unwrap().configure(addr_b, mask);

        let net = Ipv4Addr::new(10, 0, 0, 0);
        a.route_add(net, mask, None, ia, 0, 0).unwrap();
        b.route_add(net, mask, None, ib, 0, 0).unwrap();

        let drv_a = Arc::new(PipeDriver { peer: OnceLock::new() });
        let drv_b = Arc::new(PipeDriver { peer: OnceLock::new() });
        drv_a.peer.set((b.clone(), ib)).ok().unwrap();
        drv_b.peer.set((a.clone(), ia)).ok().unwrap();
        a.iface_by_index(ia).unwrap().set_driver(drv_a);
        b.iface_by_index(ib).unwrap().set_driver(drv_b);

        (
            TestHost { stack: a, ifindex: ia, addr: addr_a },
            TestHost { stack: b, ifindex: ib, addr: addr_b },
        )
    }
}
