//! DHCP client
//!
//! Per-interface state machine: INIT → SELECTING → REQUESTING → BOUND,
//! with RENEWING at T1, REBINDING at T2, and a fall back to INIT on NAK
//! or lease expiry. Retries start at four seconds and double up to a
//! 64-second cap. The timer worker advances the machine.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use kos_core::bytes::{ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};

use crate::ether::MacAddr;
use crate::ip::{Ipv4Header, IPPROTO_UDP, IP_DEFAULT_TTL};
use crate::route::RTF_DYNAMIC;
use crate::udp::build_datagram;
use crate::NetStack;

/// BOOTP ports
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// RFC 2131 magic cookie
pub const DHCP_MAGIC_COOKIE: u32 = 0x6382_5363;

/// BOOTP opcodes
const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

/// Message types (option 53)
pub const DHCPDISCOVER: u8 = 1;
pub const DHCPOFFER: u8 = 2;
pub const DHCPREQUEST: u8 = 3;
pub const DHCPDECLINE: u8 = 4;
pub const DHCPACK: u8 = 5;
pub const DHCPNAK: u8 = 6;
pub const DHCPRELEASE: u8 = 7;

/// Option codes
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_REQ: u8 = 55;
const OPT_RENEWAL_T1: u8 = 58;
const OPT_REBIND_T2: u8 = 59;
const OPT_END: u8 = 255;

/// Retry backoff bounds
const DHCP_RETRY_INITIAL: Duration = Duration::from_secs(4);
const DHCP_RETRY_MAX: Duration = Duration::from_secs(64);

/// Lease length assumed when the server omits option 51
const DHCP_DEFAULT_LEASE: Duration = Duration::from_secs(3600);

/// Client states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

impl std::fmt::Display for DhcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DhcpState::Init => "INIT",
            DhcpState::Selecting => "SELECTING",
            DhcpState::Requesting => "REQUESTING",
            DhcpState::Bound => "BOUND",
            DhcpState::Renewing => "RENEWING",
            DhcpState::Rebinding => "REBINDING",
        };
        write!(f, "{}", name)
    }
}

/// A bound lease and its timers (absolute kernel-clock times)
#[derive(Debug, Clone)]
pub struct DhcpLease {
    pub addr: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub server: Ipv4Addr,
    pub start: Duration,
    pub duration: Duration,
    pub renew_at: Duration,
    pub rebind_at: Duration,
    pub expires_at: Duration,
}

/// Per-interface client state
pub struct DhcpClient {
    pub ifindex: u32,
    pub state: DhcpState,
    xid: u32,
    offered: Option<Ipv4Addr>,
    server: Option<Ipv4Addr>,
    pub lease: Option<DhcpLease>,
    retry_timeout: Duration,
    next_retry: Duration,
}

impl DhcpClient {
    fn new(ifindex: u32, now: Duration) -> Self {
        DhcpClient {
            ifindex,
            state: DhcpState::Init,
            xid: rand::random(),
            offered: None,
            server: None,
            lease: None,
            retry_timeout: DHCP_RETRY_INITIAL,
            next_retry: now,
        }
    }

    fn arm_retry(&mut self, now: Duration) {
        self.next_retry = now + self.retry_timeout;
        self.retry_timeout = (self.retry_timeout * 2).min(DHCP_RETRY_MAX);
    }

    fn reset_backoff(&mut self) {
        self.retry_timeout = DHCP_RETRY_INITIAL;
    }
}

/// Decoded DHCP message
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub chaddr: [u8; 6],
    pub options: HashMap<u8, Vec<u8>>,
}

impl DhcpMessage {
    pub fn msg_type(&self) -> Option<u8> {
        self.options.get(&OPT_MSG_TYPE).and_then(|v| v.first()).copied()
    }

    pub fn opt_addr(&self, code: u8) -> Option<Ipv4Addr> {
        self.options
            .get(&code)
            .filter(|v| v.len() >= 4)
            .map(|v| Ipv4Addr::new(v[0], v[1], v[2], v[3]))
    }

    pub fn opt_u32(&self, code: u8) -> Option<u32> {
        self.options
            .get(&code)
            .filter(|v| v.len() >= 4)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn opt_addr_list(&self, code: u8) -> Vec<Ipv4Addr> {
        self.options
            .get(&code)
            .map(|v| {
                v.chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parse(data: &[u8]) -> KernelResult<DhcpMessage> {
        let mut r = ByteReader::new(data);
        let op = r.read_u8()?;
        let _htype = r.read_u8()?;
        let _hlen = r.read_u8()?;
        let _hops = r.read_u8()?;
        let xid = r.read_u32()?;
        let _secs = r.read_u16()?;
        let _flags = r.read_u16()?;
        let ciaddr = Ipv4Addr::from(r.read_array::<4>()?);
        let yiaddr = Ipv4Addr::from(r.read_array::<4>()?);
        let _siaddr = r.read_array::<4>()?;
        let _giaddr = r.read_array::<4>()?;
        let chaddr_full = r.read_array::<16>()?;
        r.skip(64)?; // sname
        r.skip(128)?; // file
        if r.read_u32()? != DHCP_MAGIC_COOKIE {
            return Err(KernelError::ProtocolError);
        }

        let mut options = HashMap::new();
        while r.remaining() > 0 {
            let code = r.read_u8()?;
            if code == OPT_END {
                break;
            }
            if code == 0 {
                continue; // pad
            }
            let len = r.read_u8()? as usize;
            let body = r.read_slice(len)?;
            options.insert(code, body.to_vec());
        }

        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&chaddr_full[..6]);
        Ok(DhcpMessage { op, xid, ciaddr, yiaddr, chaddr, options })
    }
}

/// Build a client message (fixed BOOTP header, cookie, options)
pub fn build_client_msg(
    msg_type: u8,
    xid: u32,
    mac: MacAddr,
    ciaddr: Ipv4Addr,
    requested: Option<Ipv4Addr>,
    server: Option<Ipv4Addr>,
) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(300);
    w.write_u8(BOOTREQUEST);
    w.write_u8(1); // htype ethernet
    w.write_u8(6); // hlen
    w.write_u8(0); // hops
    w.write_u32(xid);
    w.write_u16(0); // secs
    w.write_u16(0x8000); // broadcast flag
    w.write_slice(&ciaddr.octets());
    w.write_slice(&[0; 12]); // yiaddr, siaddr, giaddr
    w.write_slice(mac.as_bytes());
    w.write_slice(&[0; 10]); // chaddr padding
    w.write_slice(&[0; 64]); // sname
    w.write_slice(&[0; 128]); // file
    w.write_u32(DHCP_MAGIC_COOKIE);

    w.write_u8(OPT_MSG_TYPE);
    w.write_u8(1);
    w.write_u8(msg_type);

    if let Some(addr) = requested {
        w.write_u8(OPT_REQUESTED_IP);
        w.write_u8(4);
        w.write_slice(&addr.octets());
    }
    if let Some(addr) = server {
        w.write_u8(OPT_SERVER_ID);
        w.write_u8(4);
        w.write_slice(&addr.octets());
    }

    w.write_u8(OPT_PARAM_REQ);
    w.write_u8(4);
    w.write_slice(&[OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS, OPT_LEASE_TIME]);

    w.write_u8(OPT_END);
    w.into_vec()
}

impl NetStack {
    /// Start acquiring a lease on an interface
    pub fn dhcp_start(&self, ifindex: u32) -> KernelResult<()> {
        let iface = self.iface_by_index(ifindex).ok_or(KernelError::NotFound)?;
        if !iface.is_up() {
            return Err(KernelError::InvalidArgument);
        }
        let now = self.clock.now();

        let mut clients = self.dhcp.lock().unwrap();
        let client = clients.entry(ifindex).or_insert_with(|| DhcpClient::new(ifindex, now));
        client.state = DhcpState::Selecting;
        client.xid = rand::random();
        client.reset_backoff();
        client.arm_retry(now);
        let xid = client.xid;
        drop(clients);

        log::debug!("{}: dhcp DISCOVER (xid {:#x})", iface.name, xid);
        self.dhcp_broadcast(ifindex, DHCPDISCOVER, xid, Ipv4Addr::UNSPECIFIED, None, None)
    }

    /// Release the lease and stop the client
    pub fn dhcp_release(&self, ifindex: u32) -> KernelResult<()> {
        let client = self
            .dhcp
            .lock()
            .unwrap()
            .remove(&ifindex)
            .ok_or(KernelError::NotFound)?;

        if let Some(lease) = &client.lease {
            let msg = build_client_msg(
                DHCPRELEASE,
                client.xid,
                self.iface_by_index(ifindex)
                    .map(|i| i.mac)
                    .unwrap_or(MacAddr::ZERO),
                lease.addr,
                None,
                Some(lease.server),
            );
            let _ = self.dhcp_unicast(lease.addr, lease.server, &msg);
        }
        if let Some(iface) = self.iface_by_index(ifindex) {
            iface.deconfigure();
        }
        self.routes.lock().unwrap().purge_iface(ifindex);
        Ok(())
    }

    /// Lease currently held on an interface
    pub fn dhcp_lease(&self, ifindex: u32) -> Option<DhcpLease> {
        self.dhcp
            .lock()
            .unwrap()
            .get(&ifindex)
            .and_then(|c| c.lease.clone())
    }

    /// Client state on an interface
    pub fn dhcp_state(&self, ifindex: u32) -> Option<DhcpState> {
        self.dhcp.lock().unwrap().get(&ifindex).map(|c| c.state)
    }

    /// Handle a reply delivered to UDP port 68
    pub(crate) fn dhcp_input(&self, ifindex: u32, _ip: &Ipv4Header, payload: &[u8]) {
        let msg = match DhcpMessage::parse(payload) {
            Ok(m) => m,
            Err(_) => {
                self.stats.dhcp_errors.inc();
                return;
            }
        };
        if msg.op != BOOTREPLY {
            return;
        }

        let iface = match self.iface_by_index(ifindex) {
            Some(i) => i,
            None => return,
        };
        if msg.chaddr != *iface.mac.as_bytes() {
            return;
        }

        let now = self.clock.now();
        let mut clients = self.dhcp.lock().unwrap();
        let client = match clients.get_mut(&ifindex) {
            Some(c) if c.xid == msg.xid => c,
            _ => return,
        };

        match (msg.msg_type(), client.state) {
            (Some(DHCPOFFER), DhcpState::Selecting) => {
                let offered = msg.yiaddr;
                let server = msg.opt_addr(OPT_SERVER_ID);

                // Somebody already answering ARP for the offered address
                // with a foreign MAC means the lease is unusable.
                let conflict = self
                    .arp_lookup(offered)
                    .map(|mac| mac != iface.mac)
                    .unwrap_or(false);
                if conflict {
                    log::warn!("{}: declining {} (address in use)", iface.name, offered);
                    let xid = client.xid;
                    client.state = DhcpState::Init;
                    client.arm_retry(now);
                    drop(clients);
                    let _ = self.dhcp_broadcast(
                        ifindex,
                        DHCPDECLINE,
                        xid,
                        Ipv4Addr::UNSPECIFIED,
                        Some(offered),
                        server,
                    );
                    return;
                }

                client.offered = Some(offered);
                client.server = server;
                client.state = DhcpState::Requesting;
                client.reset_backoff();
                client.arm_retry(now);
                let xid = client.xid;
                drop(clients);

                log::debug!("{}: dhcp OFFER {} -> REQUEST", iface.name, offered);
                let _ = self.dhcp_broadcast(
                    ifindex,
                    DHCPREQUEST,
                    xid,
                    Ipv4Addr::UNSPECIFIED,
                    Some(offered),
                    server,
                );
            }

            (Some(DHCPACK), DhcpState::Requesting)
            | (Some(DHCPACK), DhcpState::Renewing)
            | (Some(DHCPACK), DhcpState::Rebinding) => {
                let addr = if msg.yiaddr != Ipv4Addr::UNSPECIFIED {
                    msg.yiaddr
                } else {
                    client.offered.unwrap_or(Ipv4Addr::UNSPECIFIED)
                };
                let mask = msg
                    .opt_addr(OPT_SUBNET_MASK)
                    .unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
                let router = msg.opt_addr(OPT_ROUTER);
                let dns_servers = msg.opt_addr_list(OPT_DNS);
                let server = msg
                    .opt_addr(OPT_SERVER_ID)
                    .or(client.server)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                let duration = msg
                    .opt_u32(OPT_LEASE_TIME)
                    .map(|s| Duration::from_secs(u64::from(s)))
                    .unwrap_or(DHCP_DEFAULT_LEASE);
                let t1 = msg
                    .opt_u32(OPT_RENEWAL_T1)
                    .map(|s| Duration::from_secs(u64::from(s)))
                    .unwrap_or(duration / 2);
                let t2 = msg
                    .opt_u32(OPT_REBIND_T2)
                    .map(|s| Duration::from_secs(u64::from(s)))
                    .unwrap_or(duration * 7 / 8);

                client.lease = Some(DhcpLease {
                    addr,
                    subnet_mask: mask,
                    router,
                    dns_servers: dns_servers.clone(),
                    server,
                    start: now,
                    duration,
                    renew_at: now + t1,
                    rebind_at: now + t2,
                    expires_at: now + duration,
                });
                client.state = DhcpState::Bound;
                client.server = Some(server);
                client.reset_backoff();
                drop(clients);

                log::debug!(
                    "{}: dhcp BOUND {} mask {} lease {}s",
                    iface.name,
                    addr,
                    mask,
                    duration.as_secs()
                );
                iface.configure(addr, mask);

                let net = Ipv4Addr::from(u32::from(addr) & u32::from(mask));
                let _ = self.route_add(net, mask, None, ifindex, 0, RTF_DYNAMIC);
                if let Some(gw) = router {
                    let _ = self.route_add(
                        Ipv4Addr::UNSPECIFIED,
                        Ipv4Addr::UNSPECIFIED,
                        Some(gw),
                        ifindex,
                        0,
                        RTF_DYNAMIC,
                    );
                }
                for server in dns_servers {
                    let _ = self.dns_add_server(server);
                }
            }

            (Some(DHCPNAK), _) => {
                log::warn!("{}: dhcp NAK, restarting", iface.name);
                client.state = DhcpState::Init;
                client.lease = None;
                client.offered = None;
                client.server = None;
                client.reset_backoff();
                client.next_retry = now;
                drop(clients);
                iface.deconfigure();
                self.routes.lock().unwrap().purge_iface(ifindex);
            }

            _ => {}
        }
    }

    /// Timer-driven state advancement
    pub(crate) fn dhcp_sweep(&self, now: Duration) {
        // Collect due work under the lock, send after dropping it.
        struct Due {
            ifindex: u32,
            msg_type: u8,
            xid: u32,
            ciaddr: Ipv4Addr,
            requested: Option<Ipv4Addr>,
            server: Option<Ipv4Addr>,
            unicast_to: Option<Ipv4Addr>,
        }
        let mut due: Vec<Due> = Vec::new();
        let mut deconfigure: Vec<u32> = Vec::new();

        {
            let mut clients = self.dhcp.lock().unwrap();
            for client in clients.values_mut() {
                match client.state {
                    DhcpState::Init => {
                        if now >= client.next_retry {
                            client.state = DhcpState::Selecting;
                            client.xid = rand::random();
                            client.arm_retry(now);
                            due.push(Due {
                                ifindex: client.ifindex,
                                msg_type: DHCPDISCOVER,
                                xid: client.xid,
                                ciaddr: Ipv4Addr::UNSPECIFIED,
                                requested: None,
                                server: None,
                                unicast_to: None,
                            });
                        }
                    }
                    DhcpState::Selecting => {
                        if now >= client.next_retry {
                            client.arm_retry(now);
                            due.push(Due {
                                ifindex: client.ifindex,
                                msg_type: DHCPDISCOVER,
                                xid: client.xid,
                                ciaddr: Ipv4Addr::UNSPECIFIED,
                                requested: None,
                                server: None,
                                unicast_to: None,
                            });
                        }
                    }
                    DhcpState::Requesting => {
                        if now >= client.next_retry {
                            client.arm_retry(now);
                            due.push(Due {
                                ifindex: client.ifindex,
                                msg_type: DHCPREQUEST,
                                xid: client.xid,
                                ciaddr: Ipv4Addr::UNSPECIFIED,
                                requested: client.offered,
                                server: client.server,
                                unicast_to: None,
                            });
                        }
                    }
                    DhcpState::Bound => {
                        if let Some(lease) = client.lease.clone() {
                            if now >= lease.renew_at {
                                client.state = DhcpState::Renewing;
                                client.reset_backoff();
                                client.arm_retry(now);
                                due.push(Due {
                                    ifindex: client.ifindex,
                                    msg_type: DHCPREQUEST,
                                    xid: client.xid,
                                    ciaddr: lease.addr,
                                    requested: None,
                                    server: client.server,
                                    unicast_to: Some(lease.server),
                                });
                            }
                        }
                    }
                    DhcpState::Renewing => {
                        if let Some(lease) = client.lease.clone() {
                            if now >= lease.rebind_at {
                                client.state = DhcpState::Rebinding;
                                client.reset_backoff();
                                client.arm_retry(now);
                                due.push(Due {
                                    ifindex: client.ifindex,
                                    msg_type: DHCPREQUEST,
                                    xid: client.xid,
                                    ciaddr: lease.addr,
                                    requested: None,
                                    server: None,
                                    unicast_to: None,
                                });
                            } else if now >= client.next_retry {
                                client.arm_retry(now);
                                due.push(Due {
                                    ifindex: client.ifindex,
                                    msg_type: DHCPREQUEST,
                                    xid: client.xid,
                                    ciaddr: lease.addr,
                                    requested: None,
                                    server: client.server,
                                    unicast_to: Some(lease.server),
                                });
                            }
                        }
                    }
                    DhcpState::Rebinding => {
                        if let Some(lease) = client.lease.clone() {
                            if now >= lease.expires_at {
                                log::warn!("iface {}: dhcp lease expired", client.ifindex);
                                client.state = DhcpState::Init;
                                client.lease = None;
                                client.offered = None;
                                client.server = None;
                                client.reset_backoff();
                                client.next_retry = now;
                                deconfigure.push(client.ifindex);
                            } else if now >= client.next_retry {
                                client.arm_retry(now);
                                due.push(Due {
                                    ifindex: client.ifindex,
                                    msg_type: DHCPREQUEST,
                                    xid: client.xid,
                                    ciaddr: lease.addr,
                                    requested: None,
                                    server: None,
                                    unicast_to: None,
                                });
                            }
                        }
                    }
                }
            }
        }

        for ifindex in deconfigure {
            if let Some(iface) = self.iface_by_index(ifindex) {
                iface.deconfigure();
            }
            self.routes.lock().unwrap().purge_iface(ifindex);
        }

        for d in due {
            let result = match d.unicast_to {
                Some(server) => {
                    let iface_mac = self
                        .iface_by_index(d.ifindex)
                        .map(|i| i.mac)
                        .unwrap_or(MacAddr::ZERO);
                    let msg =
                        build_client_msg(d.msg_type, d.xid, iface_mac, d.ciaddr, d.requested, d.server);
                    self.dhcp_unicast(d.ciaddr, server, &msg)
                }
                None => self.dhcp_broadcast(d.ifindex, d.msg_type, d.xid, d.ciaddr, d.requested, d.server),
            };
            if let Err(err) = result {
                log::debug!("iface {}: dhcp send failed: {}", d.ifindex, err);
            }
        }
    }

    /// Broadcast a client message on the link (pre-address path)
    fn dhcp_broadcast(
        &self,
        ifindex: u32,
        msg_type: u8,
        xid: u32,
        ciaddr: Ipv4Addr,
        requested: Option<Ipv4Addr>,
        server: Option<Ipv4Addr>,
    ) -> KernelResult<()> {
        let iface = self.iface_by_index(ifindex).ok_or(KernelError::NotFound)?;
        let msg = build_client_msg(msg_type, xid, iface.mac, ciaddr, requested, server);
        self.stats.dhcp_out.inc();
        self.udp_send_link(
            ifindex,
            SocketAddrV4::new(ciaddr, DHCP_CLIENT_PORT),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_SERVER_PORT),
            MacAddr::BROADCAST,
            &msg,
        )
    }

    /// Unicast a client message once the interface is configured
    fn dhcp_unicast(&self, src: Ipv4Addr, server: Ipv4Addr, msg: &[u8]) -> KernelResult<()> {
        let dgram = build_datagram(src, server, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, msg);
        self.stats.dhcp_out.inc();
        self.ip_output(Some(src), server, IPPROTO_UDP, IP_DEFAULT_TTL, false, &dgram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::stack_with_iface_unconfigured;

    /// Build a server reply the way a DHCP server would
    fn server_reply(
        msg_type: u8,
        xid: u32,
        client_mac: MacAddr,
        yiaddr: Ipv4Addr,
        server: Ipv4Addr,
        lease_secs: u32,
    ) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(300);
        w.write_u8(BOOTREPLY);
        w.write_u8(1);
        w.write_u8(6);
        w.write_u8(0);
        w.write_u32(xid);
        w.write_u16(0);
        w.write_u16(0);
        w.write_slice(&[0; 4]); // ciaddr
        w.write_slice(&yiaddr.octets());
        w.write_slice(&server.octets()); // siaddr
        w.write_slice(&[0; 4]); // giaddr
        w.write_slice(client_mac.as_bytes());
        w.write_slice(&[0; 10]);
        w.write_slice(&[0; 64]);
        w.write_slice(&[0; 128]);
        w.write_u32(DHCP_MAGIC_COOKIE);
        w.write_u8(OPT_MSG_TYPE);
        w.write_u8(1);
        w.write_u8(msg_type);
        w.write_u8(OPT_SERVER_ID);
        w.write_u8(4);
        w.write_slice(&server.octets());
        w.write_u8(OPT_SUBNET_MASK);
        w.write_u8(4);
        w.write_slice(&Ipv4Addr::new(255, 255, 255, 0).octets());
        w.write_u8(OPT_ROUTER);
        w.write_u8(4);
        w.write_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
        w.write_u8(OPT_LEASE_TIME);
        w.write_u8(4);
        w.write_u32(lease_secs);
        w.write_u8(OPT_END);
        w.into_vec()
    }

    fn deliver_reply(stack: &crate::NetStack, ifindex: u32, reply: &[u8]) {
        let hdr = Ipv4Header {
            ihl: 20,
            tos: 0,
            total_len: (20 + 8 + reply.len()) as u16,
            id: 0,
            flags_frag: 0,
            ttl: 64,
            protocol: IPPROTO_UDP,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::BROADCAST,
        };
        stack.dhcp_input(ifindex, &hdr, reply);
    }

    #[test]
    fn test_message_round_trip() {
        let mac = MacAddr([2, 0, 0, 0, 0, 7]);
        let msg = build_client_msg(
            DHCPDISCOVER,
            0xAABBCCDD,
            mac,
            Ipv4Addr::UNSPECIFIED,
            None,
            None,
        );
        let parsed = DhcpMessage::parse(&msg).unwrap();
        assert_eq!(parsed.op, BOOTREQUEST);
        assert_eq!(parsed.xid, 0xAABBCCDD);
        assert_eq!(parsed.chaddr, *mac.as_bytes());
        assert_eq!(parsed.msg_type(), Some(DHCPDISCOVER));
    }

    #[test]
    fn test_bad_cookie_rejected() {
        let mac = MacAddr([2, 0, 0, 0, 0, 7]);
        let mut msg = build_client_msg(DHCPDISCOVER, 1, mac, Ipv4Addr::UNSPECIFIED, None, None);
        msg[236] = 0; // corrupt the cookie
        assert!(DhcpMessage::parse(&msg).is_err());
    }

    #[test]
    fn test_happy_path_to_bound_and_renewing() {
        let (stack, ifindex) = stack_with_iface_unconfigured();
        let iface = stack.iface_by_index(ifindex).unwrap();
        let server = Ipv4Addr::new(10, 0, 0, 1);

        stack.dhcp_start(ifindex).unwrap();
        assert_eq!(stack.dhcp_state(ifindex), Some(DhcpState::Selecting));

        // Server offers 10.0.0.5 with a 120s lease.
        let xid = stack.dhcp.lock().unwrap().get(&ifindex).unwrap().xid;
        deliver_reply(
            &stack,
            ifindex,
            &server_reply(DHCPOFFER, xid, iface.mac, Ipv4Addr::new(10, 0, 0, 5), server, 120),
        );
        assert_eq!(stack.dhcp_state(ifindex), Some(DhcpState::Requesting));

        deliver_reply(
            &stack,
            ifindex,
            &server_reply(DHCPACK, xid, iface.mac, Ipv4Addr::new(10, 0, 0, 5), server, 120),
        );
        assert_eq!(stack.dhcp_state(ifindex), Some(DhcpState::Bound));

        // The interface carries the leased address.
        assert_eq!(iface.addr(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        let lease = stack.dhcp_lease(ifindex).unwrap();
        assert_eq!(lease.duration, Duration::from_secs(120));

        // At T1 (half the lease) the client starts renewing.
        stack.clock.advance(Duration::from_secs(60));
        stack.dhcp_sweep(stack.clock.now());
        assert_eq!(stack.dhcp_state(ifindex), Some(DhcpState::Renewing));
    }

    #[test]
    fn test_nak_restarts() {
        let (stack, ifindex) = stack_with_iface_unconfigured();
        let iface = stack.iface_by_index(ifindex).unwrap();
        let server = Ipv4Addr::new(10, 0, 0, 1);

        stack.dhcp_start(ifindex).unwrap();
        let xid = stack.dhcp.lock().unwrap().get(&ifindex).unwrap().xid;
        deliver_reply(
            &stack,
            ifindex,
            &server_reply(DHCPOFFER, xid, iface.mac, Ipv4Addr::new(10, 0, 0, 5), server, 120),
        );
        deliver_reply(
            &stack,
            ifindex,
            &server_reply(DHCPNAK, xid, iface.mac, Ipv4Addr::UNSPECIFIED, server, 0),
        );
        assert_eq!(stack.dhcp_state(ifindex), Some(DhcpState::Init));
        assert_eq!(iface.addr(), None);
    }

    #[test]
    fn test_retry_backoff_doubles_to_cap() {
        let (stack, ifindex) = stack_with_iface_unconfigured();
        stack.dhcp_start(ifindex).unwrap();

        // No server: drive the sweep through the backoff schedule.
        let mut expected = DHCP_RETRY_INITIAL;
        for _ in 0..6 {
            let timeout = stack
                .dhcp
                .lock()
                .unwrap()
                .get(&ifindex)
                .unwrap()
                .retry_timeout;
            assert_eq!(timeout, (expected * 2).min(DHCP_RETRY_MAX));
            stack.clock.advance(expected + Duration::from_secs(1));
            stack.dhcp_sweep(stack.clock.now());
            expected = (expected * 2).min(DHCP_RETRY_MAX);
        }
        let timeout = stack
            .dhcp
            .lock()
            .unwrap()
            .get(&ifindex)
            .unwrap()
            .retry_timeout;
        assert_eq!(timeout, DHCP_RETRY_MAX);
    }
}
