//! Socket layer
//!
//! A uniform façade over TCP and UDP. Each socket owns a receive queue
//! and a send queue behind their own locks; control state (addresses,
//! connection state, accept backlog) sits behind the core lock. Calls
//! never block while holding a lock; `WouldBlock` signals no progress,
//! and the RCVTIMEO/SNDTIMEO options bound how long a call may poll for
//! it.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kos_core::error::{KernelError, KernelResult};
use kos_core::SocketId;

use crate::ip::{IPPROTO_TCP, IPPROTO_UDP};
use crate::tcp::tcb::Tcb;
use crate::NetStack;

/// Address families
pub const AF_INET: u32 = 2;

/// Socket types
pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;

/// Socket option names (crate-defined values, not host values)
pub const SO_REUSEADDR: u32 = 2;
pub const SO_SNDBUF: u32 = 7;
pub const SO_RCVBUF: u32 = 8;
pub const SO_KEEPALIVE: u32 = 9;
pub const SO_RCVTIMEO: u32 = 20;
pub const SO_SNDTIMEO: u32 = 21;
pub const TCP_NODELAY: u32 = 101;

/// `shutdown` directions
pub const SHUT_RD: u32 = 0;
pub const SHUT_WR: u32 = 1;
pub const SHUT_RDWR: u32 = 2;

/// Default socket queue capacity
pub const SOCK_QUEUE_CAP: usize = 64 * 1024;

/// Poll granularity while a timed call waits for progress
const SOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Typed socket option value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptVal {
    Bool(bool),
    Time(Duration),
    Size(usize),
}

/// Connection state as seen by the socket layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Listening,
    Closed,
}

/// Recognized socket options
#[derive(Debug, Clone)]
pub struct SockOpts {
    pub reuse_addr: bool,
    pub keepalive: bool,
    pub nodelay: bool,
    pub rcv_timeout: Option<Duration>,
    pub snd_timeout: Option<Duration>,
    pub rcv_buf: usize,
    pub snd_buf: usize,
}

impl Default for SockOpts {
    fn default() -> Self {
        SockOpts {
            reuse_addr: false,
            keepalive: false,
            nodelay: false,
            rcv_timeout: None,
            snd_timeout: None,
            rcv_buf: SOCK_QUEUE_CAP,
            snd_buf: SOCK_QUEUE_CAP,
        }
    }
}

/// Mutable control state behind the core lock
pub(crate) struct SockCore {
    pub state: SocketState,
    pub local: Option<SocketAddrV4>,
    pub remote: Option<SocketAddrV4>,
    pub backlog: usize,
    pub accept_queue: VecDeque<SocketId>,
    /// Listener that spawned this connection, if any
    pub parent: Option<SocketId>,
    /// Asynchronous error (RST, refused connect, timed-out retransmit)
    pub error: Option<KernelError>,
    pub shutdown_rd: bool,
    pub shutdown_wr: bool,
    pub closed_by_user: bool,
}

impl SockCore {
    fn new() -> Self {
        SockCore {
            state: SocketState::Unconnected,
            local: None,
            remote: None,
            backlog: 0,
            accept_queue: VecDeque::new(),
            parent: None,
            error: None,
            shutdown_rd: false,
            shutdown_wr: false,
            closed_by_user: false,
        }
    }
}

/// Byte-budgeted receive queue
///
/// Stream sockets append bytes; datagram sockets keep message bounds.
pub(crate) struct RecvQueue {
    stream: VecDeque<u8>,
    dgrams: VecDeque<(SocketAddrV4, Vec<u8>)>,
    bytes: usize,
    cap: usize,
    eof: bool,
}

impl RecvQueue {
    fn new(cap: usize) -> Self {
        RecvQueue {
            stream: VecDeque::new(),
            dgrams: VecDeque::new(),
            bytes: 0,
            cap,
            eof: false,
        }
    }

    pub(crate) fn push_stream(&mut self, data: &[u8]) -> bool {
        if self.bytes + data.len() > self.cap {
            return false;
        }
        self.stream.extend(data);
        self.bytes += data.len();
        true
    }

    pub(crate) fn read_stream(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.stream.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.stream.pop_front().expect("length checked");
        }
        self.bytes -= n;
        n
    }

    pub(crate) fn push_dgram(&mut self, src: SocketAddrV4, data: &[u8]) -> bool {
        if self.bytes + data.len() > self.cap {
            return false;
        }
        self.dgrams.push_back((src, data.to_vec()));
        self.bytes += data.len();
        true
    }

    pub(crate) fn pop_dgram(&mut self) -> Option<(SocketAddrV4, Vec<u8>)> {
        let (src, data) = self.dgrams.pop_front()?;
        self.bytes -= data.len();
        Some((src, data))
    }

    pub(crate) fn byte_count(&self) -> usize {
        self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stream.is_empty() && self.dgrams.is_empty()
    }

    pub(crate) fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
    }

    pub(crate) fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }
}

/// Byte-budgeted send queue (unsent stream data)
pub(crate) struct SendQueue {
    buf: VecDeque<u8>,
    cap: usize,
}

impl SendQueue {
    fn new(cap: usize) -> Self {
        SendQueue { buf: VecDeque::new(), cap }
    }

    /// Accept as much as fits; returns the number of bytes queued
    pub(crate) fn push(&mut self, data: &[u8]) -> usize {
        let room = self.cap.saturating_sub(self.buf.len());
        let n = room.min(data.len());
        self.buf.extend(&data[..n]);
        n
    }

    pub(crate) fn pop(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
    }
}

/// A socket
pub struct Socket {
    pub id: SocketId,
    pub domain: u32,
    pub stype: u32,
    pub protocol: u8,

    pub(crate) core: Mutex<SockCore>,
    pub(crate) recv_q: Mutex<RecvQueue>,
    pub(crate) send_q: Mutex<SendQueue>,
    pub(crate) opts: Mutex<SockOpts>,
    pub(crate) tcb: Mutex<Option<Tcb>>,
}

impl Socket {
    fn new(id: SocketId, domain: u32, stype: u32, protocol: u8) -> Self {
        Socket {
            id,
            domain,
            stype,
            protocol,
            core: Mutex::new(SockCore::new()),
            recv_q: Mutex::new(RecvQueue::new(SOCK_QUEUE_CAP)),
            send_q: Mutex::new(SendQueue::new(SOCK_QUEUE_CAP)),
            opts: Mutex::new(SockOpts::default()),
            tcb: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SocketState {
        self.core.lock().unwrap().state
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.core.lock().unwrap().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.core.lock().unwrap().remote
    }
}

/// Socket registry embedded in the stack
pub(crate) type SocketTable = HashMap<SocketId, Arc<Socket>>;

impl NetStack {
    /// Create a socket
    pub fn socket(&self, domain: u32, stype: u32, protocol: u32) -> KernelResult<SocketId> {
        if domain != AF_INET {
            return Err(KernelError::InvalidArgument);
        }
        let proto = match (stype, protocol) {
            (SOCK_STREAM, 0) => IPPROTO_TCP,
            (SOCK_STREAM, p) if p == IPPROTO_TCP as u32 => IPPROTO_TCP,
            (SOCK_DGRAM, 0) => IPPROTO_UDP,
            (SOCK_DGRAM, p) if p == IPPROTO_UDP as u32 => IPPROTO_UDP,
            _ => return Err(KernelError::InvalidArgument),
        };

        let id = SocketId::new(self.next_sock.fetch_add(1, Ordering::Relaxed));
        let sock = Arc::new(Socket::new(id, domain, stype, proto));
        self.sockets.write().unwrap().insert(id, sock);
        Ok(id)
    }

    /// Derive the connection socket for a passive open
    pub(crate) fn socket_derive_stream(
        &self,
        parent: SocketId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> KernelResult<SocketId> {
        let opts = self.socket_get(parent)?.opts.lock().unwrap().clone();

        let id = SocketId::new(self.next_sock.fetch_add(1, Ordering::Relaxed));
        let sock = Arc::new(Socket::new(id, AF_INET, SOCK_STREAM, IPPROTO_TCP));
        {
            let mut core = sock.core.lock().unwrap();
            core.state = SocketState::Connecting;
            core.local = Some(local);
            core.remote = Some(remote);
            core.parent = Some(parent);
        }
        *sock.opts.lock().unwrap() = opts;
        self.sockets.write().unwrap().insert(id, sock);
        Ok(id)
    }

    /// Resolve a descriptor
    pub fn socket_get(&self, id: SocketId) -> KernelResult<Arc<Socket>> {
        self.sockets
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(KernelError::BadDescriptor)
    }

    /// Bind to a local address
    pub fn bind(&self, id: SocketId, addr: SocketAddrV4) -> KernelResult<()> {
        let sock = self.socket_get(id)?;
        {
            let core = sock.core.lock().unwrap();
            if core.local.is_some() {
                return Err(KernelError::InvalidArgument);
            }
            if !matches!(core.state, SocketState::Unconnected) {
                return Err(KernelError::AlreadyConnected);
            }
        }
        if *addr.ip() != Ipv4Addr::UNSPECIFIED
            && !self.is_local_addr(*addr.ip())
            && *addr.ip() != Ipv4Addr::LOCALHOST
        {
            return Err(KernelError::AddressNotAvailable);
        }
        match sock.protocol {
            IPPROTO_TCP => self.tcp_bind(id, &sock, addr),
            IPPROTO_UDP => self.udp_bind(id, &sock, addr),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Start listening (TCP only)
    pub fn listen(&self, id: SocketId, backlog: usize) -> KernelResult<()> {
        let sock = self.socket_get(id)?;
        if sock.protocol != IPPROTO_TCP {
            return Err(KernelError::InvalidArgument);
        }
        self.tcp_listen(id, &sock, backlog)
    }

    /// Take one established connection off the accept queue
    pub fn accept(&self, id: SocketId) -> KernelResult<SocketId> {
        let sock = self.socket_get(id)?;
        let timeout = sock.opts.lock().unwrap().rcv_timeout;

        self.poll_until(timeout, || {
            let mut core = sock.core.lock().unwrap();
            if core.state != SocketState::Listening {
                return Some(Err(KernelError::InvalidArgument));
            }
            core.accept_queue.pop_front().map(Ok)
        })
    }

    /// Connect to a remote address
    pub fn connect(&self, id: SocketId, addr: SocketAddrV4) -> KernelResult<()> {
        let sock = self.socket_get(id)?;
        match sock.protocol {
            IPPROTO_TCP => self.tcp_connect(id, &sock, addr),
            IPPROTO_UDP => {
                // Datagram connect just pins the peer.
                let mut core = sock.core.lock().unwrap();
                if core.state == SocketState::Listening {
                    return Err(KernelError::InvalidArgument);
                }
                core.remote = Some(addr);
                core.state = SocketState::Connected;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Send on a connected socket
    pub fn send(&self, id: SocketId, data: &[u8]) -> KernelResult<usize> {
        let sock = self.socket_get(id)?;
        if let Some(err) = sock.core.lock().unwrap().error.take() {
            return Err(err);
        }
        match sock.protocol {
            IPPROTO_TCP => self.tcp_send(&sock, data),
            IPPROTO_UDP => {
                let remote = sock
                    .core
                    .lock()
                    .unwrap()
                    .remote
                    .ok_or(KernelError::NotConnected)?;
                self.udp_output(&sock, remote, data)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Send to an explicit destination
    ///
    /// For datagram sockets the stored peer is untouched; the call's
    /// destination applies only for its duration.
    pub fn sendto(&self, id: SocketId, data: &[u8], dst: SocketAddrV4) -> KernelResult<usize> {
        let sock = self.socket_get(id)?;
        match sock.protocol {
            IPPROTO_UDP => self.udp_output(&sock, dst, data),
            IPPROTO_TCP => {
                // Stream sockets ignore the address if it matches the
                // peer, per the classic API.
                let remote = sock.core.lock().unwrap().remote;
                match remote {
                    Some(peer) if peer == dst => self.tcp_send(&sock, data),
                    Some(_) => Err(KernelError::AlreadyConnected),
                    None => Err(KernelError::NotConnected),
                }
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Receive into `buf`; returns the byte count
    pub fn recv(&self, id: SocketId, buf: &mut [u8]) -> KernelResult<usize> {
        self.recvfrom(id, buf).map(|(n, _)| n)
    }

    /// Receive with the sender's address
    pub fn recvfrom(&self, id: SocketId, buf: &mut [u8]) -> KernelResult<(usize, SocketAddrV4)> {
        let sock = self.socket_get(id)?;
        let timeout = sock.opts.lock().unwrap().rcv_timeout;

        self.poll_until(timeout, || {
            // Core state first, then the queue lock; never both at once.
            let peer = {
                let mut core = sock.core.lock().unwrap();
                if let Some(err) = core.error.take() {
                    return Some(Err(err));
                }
                if core.shutdown_rd {
                    return Some(Ok((0, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))));
                }
                core.remote
                    .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            };

            let mut q = sock.recv_q.lock().unwrap();
            match sock.stype {
                SOCK_STREAM => {
                    let n = q.read_stream(buf);
                    if n > 0 {
                        Some(Ok((n, peer)))
                    } else if q.is_eof() {
                        Some(Ok((0, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))))
                    } else {
                        None
                    }
                }
                _ => q.pop_dgram().map(|(src, data)| {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, src))
                }),
            }
        })
    }

    /// Set a socket option
    pub fn setsockopt(&self, id: SocketId, name: u32, value: OptVal) -> KernelResult<()> {
        let sock = self.socket_get(id)?;
        let mut opts = sock.opts.lock().unwrap();
        match (name, value) {
            (SO_REUSEADDR, OptVal::Bool(v)) => opts.reuse_addr = v,
            (SO_KEEPALIVE, OptVal::Bool(v)) => opts.keepalive = v,
            (TCP_NODELAY, OptVal::Bool(v)) => opts.nodelay = v,
            (SO_RCVTIMEO, OptVal::Time(d)) => {
                opts.rcv_timeout = if d.is_zero() { None } else { Some(d) }
            }
            (SO_SNDTIMEO, OptVal::Time(d)) => {
                opts.snd_timeout = if d.is_zero() { None } else { Some(d) }
            }
            (SO_RCVBUF, OptVal::Size(n)) => {
                let n = n.clamp(1, SOCK_QUEUE_CAP);
                opts.rcv_buf = n;
                sock.recv_q.lock().unwrap().set_cap(n);
            }
            (SO_SNDBUF, OptVal::Size(n)) => {
                let n = n.clamp(1, SOCK_QUEUE_CAP);
                opts.snd_buf = n;
                sock.send_q.lock().unwrap().set_cap(n);
            }
            (SO_REUSEADDR | SO_KEEPALIVE | TCP_NODELAY | SO_RCVTIMEO | SO_SNDTIMEO
            | SO_RCVBUF | SO_SNDBUF, _) => return Err(KernelError::InvalidArgument),
            _ => return Err(KernelError::NoProtoOption),
        }
        Ok(())
    }

    /// Read a socket option
    pub fn getsockopt(&self, id: SocketId, name: u32) -> KernelResult<OptVal> {
        let sock = self.socket_get(id)?;
        let opts = sock.opts.lock().unwrap();
        let val = match name {
            SO_REUSEADDR => OptVal::Bool(opts.reuse_addr),
            SO_KEEPALIVE => OptVal::Bool(opts.keepalive),
            TCP_NODELAY => OptVal::Bool(opts.nodelay),
            SO_RCVTIMEO => OptVal::Time(opts.rcv_timeout.unwrap_or(Duration::ZERO)),
            SO_SNDTIMEO => OptVal::Time(opts.snd_timeout.unwrap_or(Duration::ZERO)),
            SO_RCVBUF => OptVal::Size(opts.rcv_buf),
            SO_SNDBUF => OptVal::Size(opts.snd_buf),
            _ => return Err(KernelError::NoProtoOption),
        };
        Ok(val)
    }

    /// Shut down one or both directions
    pub fn shutdown_socket(&self, id: SocketId, how: u32) -> KernelResult<()> {
        let sock = self.socket_get(id)?;
        {
            let mut core = sock.core.lock().unwrap();
            match core.state {
                SocketState::Connected | SocketState::Disconnecting => {}
                _ => return Err(KernelError::NotConnected),
            }
            match how {
                SHUT_RD => core.shutdown_rd = true,
                SHUT_WR => core.shutdown_wr = true,
                SHUT_RDWR => {
                    core.shutdown_rd = true;
                    core.shutdown_wr = true;
                }
                _ => return Err(KernelError::InvalidArgument),
            }
        }
        // A write shutdown on TCP sends our FIN.
        if sock.protocol == IPPROTO_TCP && (how == SHUT_WR || how == SHUT_RDWR) {
            self.tcp_close(id, &sock);
        }
        Ok(())
    }

    /// Close and release the descriptor
    pub fn close(&self, id: SocketId) -> KernelResult<()> {
        let sock = self.socket_get(id)?;
        let (local, pending_children) = {
            let mut core = sock.core.lock().unwrap();
            core.closed_by_user = true;
            (core.local, std::mem::take(&mut core.accept_queue))
        };

        // Connections still parked on a closing listener go down too.
        for child in pending_children {
            let _ = self.close(child);
        }

        match sock.protocol {
            IPPROTO_UDP => {
                if let Some(local) = local {
                    self.udp_unbind(id, local);
                }
                self.sockets.write().unwrap().remove(&id);
            }
            IPPROTO_TCP => {
                self.tcp_close(id, &sock);
                let gone = {
                    let guard = sock.tcb.lock().unwrap();
                    match guard.as_ref() {
                        None => true,
                        Some(t) => t.state == crate::tcp::tcb::TcpState::Closed,
                    }
                };
                if gone {
                    if let Some(local) = local {
                        // Release a bare binding that never connected.
                        self.tcp_unregister(
                            id,
                            local,
                            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
                        );
                    }
                    self.sockets.write().unwrap().remove(&id);
                }
                // Otherwise the FIN exchange finishes first; the sweep
                // reaps the socket once the control block closes.
            }
            _ => {
                self.sockets.write().unwrap().remove(&id);
            }
        }
        Ok(())
    }

    /// Poll `f` until it produces a result or the timeout elapses
    ///
    /// With no timeout the call is strictly non-blocking and reports
    /// `WouldBlock` immediately; this is the only place socket calls
    /// wait, and no lock is held across the sleep.
    fn poll_until<T>(
        &self,
        timeout: Option<Duration>,
        mut f: impl FnMut() -> Option<KernelResult<T>>,
    ) -> KernelResult<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(result) = f() {
                return result;
            }
            match deadline {
                None => return Err(KernelError::WouldBlock),
                Some(d) if Instant::now() >= d => return Err(KernelError::WouldBlock),
                Some(_) => std::thread::sleep(SOCK_POLL_INTERVAL),
            }
        }
    }

    /// Reap a socket whose TCP control block has fully closed
    pub(crate) fn socket_reap(&self, id: SocketId) {
        let closed_by_user = self
            .socket_get(id)
            .map(|s| s.core.lock().unwrap().closed_by_user)
            .unwrap_or(false);
        if closed_by_user {
            self.sockets.write().unwrap().remove(&id);
        }
    }
}
