//! TCP
//!
//! Control blocks are indexed by the (local addr, local port, remote addr,
//! remote port) tuple; listeners by (local addr or wildcard, local port).
//! Segment processing runs under the owning socket's control-block lock,
//! so state machine transitions are serialized per connection. Outbound
//! segments are built under the lock and transmitted after it is dropped.

pub mod tcb;
pub mod wire;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::PacketBuffer;
use kos_core::SocketId;

use crate::ip::{Ipv4Header, IPPROTO_TCP, IP_DEFAULT_TTL};
use crate::socket::{Socket, SocketState};
use crate::NetStack;

use tcb::{Tcb, TcpState, TCP_DELACK, TCP_KEEPALIVE_IDLE, TCP_KEEPALIVE_INTVL,
          TCP_KEEPALIVE_PROBES, TCP_RECV_WND, TCP_SYN_RETRIES, TCP_TIME_WAIT};
use wire::{build_segment, seq_gt, seq_leq, tcp_checksum, TcpHeader, TCP_ACK, TCP_FIN,
           TCP_PSH, TCP_RST, TCP_SYN};

/// Retransmissions of a data segment before the connection is reset
const TCP_DATA_RETRIES: u32 = 15;

/// Connection lookup key: (local addr, local port, remote addr, remote port)
pub type TcpKey = (Ipv4Addr, u16, Ipv4Addr, u16);

/// Protocol lookup tables, used under the stack's tcp lock
#[derive(Default)]
pub struct TcpRegistry {
    pub(crate) conns: HashMap<TcpKey, SocketId>,
    pub(crate) listeners: HashMap<(Ipv4Addr, u16), SocketId>,
    pub(crate) bound: HashMap<(Ipv4Addr, u16), SocketId>,
    next_ephemeral: u16,
}

impl TcpRegistry {
    /// Allocate an ephemeral port, skipping ones in use
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

/// A segment built under the control-block lock, sent after it drops
struct OutSeg {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: Vec<u8>,
}

impl OutSeg {
    fn pure(tcb: &Tcb, flags: u8) -> OutSeg {
        OutSeg {
            local: tcb.local,
            remote: tcb.remote,
            seq: tcb.snd_nxt,
            ack: tcb.rcv_nxt,
            flags,
            window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            mss: None,
            payload: Vec::new(),
        }
    }
}

/// Build a segment that consumes sequence space and track it for
/// retransmission
fn emit(tcb: &mut Tcb, flags: u8, payload: Vec<u8>, now: Duration, out: &mut Vec<OutSeg>) {
    let seq = tcb.snd_nxt;
    let mut len = payload.len() as u32;
    if flags & TCP_SYN != 0 {
        len += 1;
    }
    if flags & TCP_FIN != 0 {
        len += 1;
    }
    let mss = if flags & TCP_SYN != 0 { Some(tcb.mss) } else { None };
    out.push(OutSeg {
        local: tcb.local,
        remote: tcb.remote,
        seq,
        ack: if flags & TCP_ACK != 0 { tcb.rcv_nxt } else { 0 },
        flags,
        window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
        mss,
        payload: payload.clone(),
    });
    tcb.snd_nxt = tcb.snd_nxt.wrapping_add(len);
    tcb.track_segment(seq, flags, payload, now);
    tcb.delack_at = None;
}

impl NetStack {
    /// Bind a TCP socket to a local address
    pub(crate) fn tcp_bind(
        &self,
        id: SocketId,
        sock: &Arc<Socket>,
        addr: SocketAddrV4,
    ) -> KernelResult<()> {
        let reuse = sock.opts.lock().unwrap().reuse_addr;
        let mut reg = self.tcp.lock().unwrap();

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

    /// Move a bound socket to LISTEN
    pub(crate) fn tcp_listen(
        &self,
        id: SocketId,
        sock: &Arc<Socket>,
        backlog: usize,
    ) -> KernelResult<()> {
        let mut core = sock.core.lock().unwrap();
        let local = core.local.ok_or(KernelError::InvalidArgument)?;
        match core.state {
            SocketState::Unconnected => {}
            SocketState::Listening => return Ok(()),
            _ => return Err(KernelError::AlreadyConnected),
        }
        core.state = SocketState::Listening;
        core.backlog = backlog.clamp(1, 128);
        drop(core);

        let mut tcb = sock.tcb.lock().unwrap();
        let mut block = Tcb::new(
            local,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            0,
            self.clock.now(),
        );
        block.state = TcpState::Listen;
        *tcb = Some(block);
        drop(tcb);

        self.tcp
            .lock()
            .unwrap()
            .listeners
            .insert((*local.ip(), local.port()), id);
        log::debug!("tcp: socket {} listening on {}", id, local);
        Ok(())
    }

    /// Active open
    pub(crate) fn tcp_connect(
        &self,
        id: SocketId,
        sock: &Arc<Socket>,
        dst: SocketAddrV4,
    ) -> KernelResult<()> {
        let now = self.clock.now();

        let local = {
            let core = sock.core.lock().unwrap();
            match core.state {
                SocketState::Unconnected => {}
                SocketState::Connecting | SocketState::Connected => {
                    return Err(KernelError::AlreadyConnected)
                }
                _ => return Err(KernelError::InvalidArgument),
            }
            core.local
        };

        // Pick a source from the route when unbound.
        let local = match local {
            Some(l) if l.port() != 0 => l,
            _ => {
                let route = self.route_lookup(*dst.ip())?;
                let iface = self
                    .iface_by_index(route.ifindex)
                    .ok_or(KernelError::HostUnreachable)?;
                let src_ip = iface.addr().ok_or(KernelError::AddressNotAvailable)?;
                let port = self.tcp.lock().unwrap().alloc_ephemeral(src_ip)?;
                SocketAddrV4::new(src_ip, port)
            }
        };

        {
            let mut reg = self.tcp.lock().unwrap();
            let key = (*local.ip(), local.port(), *dst.ip(), dst.port());
            if reg.conns.contains_key(&key) {
                return Err(KernelError::AddressInUse);
            }
            reg.bound.insert((*local.ip(), local.port()), id);
            reg.conns.insert(key, id);
        }

        {
            let mut core = sock.core.lock().unwrap();
            core.local = Some(local);
            core.remote = Some(dst);
            core.state = SocketState::Connecting;
        }

        let mut out = Vec::new();
        {
            let mut guard = sock.tcb.lock().unwrap();
            let iss: u32 = rand::random();
            let mut block = Tcb::new(local, dst, iss, now);
            block.state = TcpState::SynSent;
            emit(&mut block, TCP_SYN, Vec::new(), now, &mut out);
            *guard = Some(block);
        }

        self.stats.tcp_active_opens.inc();
        self.tcp_transmit(out);
        Ok(())
    }

    /// Queue application data and push what the windows allow
    pub(crate) fn tcp_send(&self, sock: &Arc<Socket>, data: &[u8]) -> KernelResult<usize> {
        let queued = {
            let core = sock.core.lock().unwrap();
            if core.shutdown_wr {
                return Err(KernelError::NotConnected);
            }
            match core.state {
                SocketState::Connected => {}
                SocketState::Connecting => return Err(KernelError::WouldBlock),
                _ => return Err(KernelError::NotConnected),
            }
            drop(core);

            let mut q = sock.send_q.lock().unwrap();
            q.push(data)
        };
        if queued == 0 {
            return Err(KernelError::WouldBlock);
        }

        let mut out = Vec::new();
        {
            let mut guard = sock.tcb.lock().unwrap();
            if let Some(tcb) = guard.as_mut() {
                self.tcp_pump(sock, tcb, &mut out);
            }
        }
        self.tcp_transmit(out);
        Ok(queued)
    }

    /// Drain the send queue into segments within the usable window
    ///
    /// Called with the control-block lock held; queue locks nest inside
    /// it per the socket lock order.
    fn tcp_pump(&self, sock: &Arc<Socket>, tcb: &mut Tcb, out: &mut Vec<OutSeg>) {
        if !matches!(tcb.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }
        let now = self.clock.now();
        let nodelay = sock.opts.lock().unwrap().nodelay;

        loop {
            let usable = tcb.usable_window();
            if usable == 0 {
                break;
            }
            let mut q = sock.send_q.lock().unwrap();
            if q.is_empty() {
                break;
            }
            let chunk = (tcb.mss as u32).min(usable).min(q.len() as u32) as usize;

            // Nagle: hold a short segment while data is in flight.
            let in_flight = tcb.snd_nxt != tcb.snd_una;
            if !nodelay && in_flight && chunk < tcb.mss as usize {
                break;
            }
            let payload = q.pop(chunk);
            drop(q);
            emit(tcb, TCP_ACK | TCP_PSH, payload, now, out);
        }

        // A pending close follows the last byte of data out the door.
        if tcb.fin_pending && sock.send_q.lock().unwrap().is_empty() {
            tcb.fin_pending = false;
            emit(tcb, TCP_ACK | TCP_FIN, Vec::new(), now, out);
            tcb.state = match tcb.state {
                TcpState::CloseWait => TcpState::LastAck,
                _ => TcpState::FinWait1,
            };
        }
    }

    /// Close one side of or the whole connection
    pub(crate) fn tcp_close(&self, id: SocketId, sock: &Arc<Socket>) {
        let now = self.clock.now();
        let mut out = Vec::new();
        let mut destroy: Option<(SocketAddrV4, SocketAddrV4)> = None;

        {
            let mut guard = sock.tcb.lock().unwrap();
            match guard.as_mut() {
                None => {}
                Some(tcb) => match tcb.state {
                    TcpState::Listen => {
                        self.tcp
                            .lock()
                            .unwrap()
                            .listeners
                            .remove(&(*tcb.local.ip(), tcb.local.port()));
                        tcb.state = TcpState::Closed;
                    }
                    TcpState::SynSent | TcpState::SynRcvd => {
                        destroy = Some((tcb.local, tcb.remote));
                        tcb.state = TcpState::Closed;
                    }
                    TcpState::Established | TcpState::CloseWait => {
                        tcb.fin_pending = true;
                        self.tcp_pump(sock, tcb, &mut out);
                    }
                    TcpState::Closed => {
                        destroy = Some((tcb.local, tcb.remote));
                    }
                    _ => {} // close already in progress
                },
            }
        }

        {
            let mut core = sock.core.lock().unwrap();
            if matches!(core.state, SocketState::Connected | SocketState::Connecting) {
                core.state = SocketState::Disconnecting;
            }
        }

        if let Some((local, remote)) = destroy {
            self.tcp_unregister(id, local, remote);
            self.socket_reap(id);
        }
        self.tcp_transmit(out);
    }

    /// TCP input path
    pub(crate) fn tcp_input(&self, _ifindex: u32, ip: &Ipv4Header, pkt: PacketBuffer) {
        let data = pkt.data();
        if tcp_checksum(ip.src, ip.dst, data) != 0 {
            self.stats.tcp_in_errors.inc();
            return;
        }
        let hdr = match TcpHeader::parse(data) {
            Ok(h) => h,
            Err(_) => {
                self.stats.tcp_in_errors.inc();
                return;
            }
        };
        let payload = &data[hdr.data_off..];
        self.stats.tcp_in.inc();

        let key: TcpKey = (ip.dst, hdr.dst_port, ip.src, hdr.src_port);
        let (conn, listener) = {
            let reg = self.tcp.lock().unwrap();
            let conn = reg.conns.get(&key).copied();
            let listener = reg
                .listeners
                .get(&(ip.dst, hdr.dst_port))
                .or_else(|| reg.listeners.get(&(Ipv4Addr::UNSPECIFIED, hdr.dst_port)))
                .copied();
            (conn, listener)
        };

        if let Some(id) = conn {
            if let Ok(sock) = self.socket_get(id) {
                self.tcp_segment(id, &sock, ip, &hdr, payload);
                return;
            }
        }

        if let Some(id) = listener {
            if hdr.has(TCP_SYN) && !hdr.has(TCP_ACK) && !hdr.has(TCP_RST) {
                self.tcp_accept_syn(id, ip, &hdr);
                return;
            }
        }

        // Nothing matched: answer with RST unless this was one.
        if !hdr.has(TCP_RST) {
            self.stats.tcp_refused.inc();
            let (seq, ack, flags) = if hdr.has(TCP_ACK) {
                (hdr.ack, 0, TCP_RST)
            } else {
                (0, hdr.seq.wrapping_add(hdr.seq_len(payload.len())), TCP_RST | TCP_ACK)
            };
            let seg = build_segment(
                ip.dst,
                ip.src,
                hdr.dst_port,
                hdr.src_port,
                seq,
                ack,
                flags,
                0,
                None,
                &[],
            );
            let _ = self.ip_output(Some(ip.dst), ip.src, IPPROTO_TCP, IP_DEFAULT_TTL, false, &seg);
        }
    }

    /// Passive open: derive a control block in SYN_RCVD off a listener
    fn tcp_accept_syn(&self, listener_id: SocketId, ip: &Ipv4Header, hdr: &TcpHeader) {
        let now = self.clock.now();
        let listener = match self.socket_get(listener_id) {
            Ok(s) => s,
            Err(_) => return,
        };

        {
            let core = listener.core.lock().unwrap();
            if core.accept_queue.len() >= core.backlog {
                self.stats.tcp_refused.inc();
                return;
            }
        }

        let local = SocketAddrV4::new(ip.dst, hdr.dst_port);
        let remote = SocketAddrV4::new(ip.src, hdr.src_port);
        let child_id = match self.socket_derive_stream(listener_id, local, remote) {
            Ok(id) => id,
            Err(_) => {
                self.stats.tcp_in_errors.inc();
                return;
            }
        };
        let child = match self.socket_get(child_id) {
            Ok(s) => s,
            Err(_) => return,
        };

        {
            let mut reg = self.tcp.lock().unwrap();
            reg.conns
                .insert((*local.ip(), local.port(), *remote.ip(), remote.port()), child_id);
        }

        let mut out = Vec::new();
        {
            let mut guard = child.tcb.lock().unwrap();
            let iss: u32 = rand::random();
            let mut block = Tcb::new(local, remote, iss, now);
            block.state = TcpState::SynRcvd;
            block.irs = hdr.seq;
            block.rcv_nxt = hdr.seq.wrapping_add(1);
            if let Some(mss) = hdr.mss {
                block.mss = block.mss.min(mss);
            }
            block.update_window(hdr.seq, hdr.ack, hdr.window as u32);
            emit(&mut block, TCP_SYN | TCP_ACK, Vec::new(), now, &mut out);
            *guard = Some(block);
        }

        self.stats.tcp_passive_opens.inc();
        self.tcp_transmit(out);
    }

    /// Per-connection segment processing
    fn tcp_segment(
        &self,
        id: SocketId,
        sock: &Arc<Socket>,
        _ip: &Ipv4Header,
        hdr: &TcpHeader,
        payload: &[u8],
    ) {
        let now = self.clock.now();
        let mut out = Vec::new();
        let mut destroy: Option<(SocketAddrV4, SocketAddrV4)> = None;
        let mut sock_error: Option<KernelError> = None;
        let mut established = false;

        {
            let mut guard = sock.tcb.lock().unwrap();
            let tcb = match guard.as_mut() {
                Some(t) => t,
                None => return,
            };
            tcb.last_activity = now;
            tcb.keepalive_probes = 0;

            match tcb.state {
                TcpState::SynSent => {
                    self.tcp_syn_sent(tcb, hdr, now, &mut out, &mut destroy, &mut sock_error,
                                      &mut established);
                }
                TcpState::Closed => {}
                _ => {
                    self.tcp_synchronized(
                        sock, tcb, hdr, payload, now, &mut out, &mut destroy, &mut sock_error,
                        &mut established,
                    );
                }
            }

            if destroy.is_none() {
                self.tcp_pump(sock, tcb, &mut out);
            }
        }

        if established {
            self.tcp_on_established(id, sock);
        }
        if let Some(err) = sock_error {
            let mut core = sock.core.lock().unwrap();
            core.error = Some(err);
            core.state = SocketState::Closed;
        }
        if let Some((local, remote)) = destroy {
            self.tcp_unregister(id, local, remote);
            self.socket_reap(id);
        }
        self.tcp_transmit(out);
    }

    /// SYN_SENT processing (RFC 793 active-open rules)
    #[allow(clippy::too_many_arguments)]
    fn tcp_syn_sent(
        &self,
        tcb: &mut Tcb,
        hdr: &TcpHeader,
        now: Duration,
        out: &mut Vec<OutSeg>,
        destroy: &mut Option<(SocketAddrV4, SocketAddrV4)>,
        sock_error: &mut Option<KernelError>,
        established: &mut bool,
    ) {
        if hdr.has(TCP_ACK) {
            // The ACK must cover our SYN exactly.
            if !seq_gt(hdr.ack, tcb.iss) || seq_gt(hdr.ack, tcb.snd_nxt) {
                if !hdr.has(TCP_RST) {
                    out.push(OutSeg {
                        local: tcb.local,
                        remote: tcb.remote,
                        seq: hdr.ack,
                        ack: 0,
                        flags: TCP_RST,
                        window: 0,
                        mss: None,
                        payload: Vec::new(),
                    });
                }
                return;
            }
        }

        if hdr.has(TCP_RST) {
            if hdr.has(TCP_ACK) {
                tcb.state = TcpState::Closed;
                *sock_error = Some(KernelError::ConnectionRefused);
                *destroy = Some((tcb.local, tcb.remote));
            }
            return;
        }

        if !hdr.has(TCP_SYN) {
            return;
        }

        tcb.irs = hdr.seq;
        tcb.rcv_nxt = hdr.seq.wrapping_add(1);
        if let Some(mss) = hdr.mss {
            tcb.mss = tcb.mss.min(mss);
        }

        if hdr.has(TCP_ACK) {
            // Our SYN is acknowledged: connection complete.
            tcb.on_ack(hdr.ack, now);
            tcb.snd_wnd = hdr.window as u32;
            tcb.snd_wl1 = hdr.seq;
            tcb.snd_wl2 = hdr.ack;
            tcb.state = TcpState::Established;
            out.push(OutSeg::pure(tcb, TCP_ACK));
            *established = true;
        } else {
            // Simultaneous open.
            tcb.state = TcpState::SynRcvd;
            // Our SYN is still on the retransmission queue; answer the
            // peer's SYN with SYN+ACK carrying the same sequence.
            out.push(OutSeg {
                local: tcb.local,
                remote: tcb.remote,
                seq: tcb.iss,
                ack: tcb.rcv_nxt,
                flags: TCP_SYN | TCP_ACK,
                window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
                mss: Some(tcb.mss),
                payload: Vec::new(),
            });
        }
    }

    /// Processing for synchronized states
    #[allow(clippy::too_many_arguments)]
    fn tcp_synchronized(
        &self,
        sock: &Arc<Socket>,
        tcb: &mut Tcb,
        hdr: &TcpHeader,
        payload: &[u8],
        now: Duration,
        out: &mut Vec<OutSeg>,
        destroy: &mut Option<(SocketAddrV4, SocketAddrV4)>,
        sock_error: &mut Option<KernelError>,
        established: &mut bool,
    ) {
        let seg_len = hdr.seq_len(payload.len());

        if !tcb.segment_acceptable(hdr.seq, seg_len) {
            if !hdr.has(TCP_RST) {
                out.push(OutSeg::pure(tcb, TCP_ACK));
            }
            return;
        }

        if hdr.has(TCP_RST) {
            tcb.state = TcpState::Closed;
            *sock_error = Some(KernelError::ConnectionReset);
            *destroy = Some((tcb.local, tcb.remote));
            self.stats.tcp_resets.inc();
            return;
        }

        // A retransmitted SYN in SYN_RCVD re-answers; any other SYN in
        // the window is ignored by this minimal core.
        if hdr.has(TCP_SYN) {
            if tcb.state == TcpState::SynRcvd && hdr.seq == tcb.irs {
                out.push(OutSeg {
                    local: tcb.local,
                    remote: tcb.remote,
                    seq: tcb.iss,
                    ack: tcb.rcv_nxt,
                    flags: TCP_SYN | TCP_ACK,
                    window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
                    mss: Some(tcb.mss),
                    payload: Vec::new(),
                });
            }
            return;
        }

        if !hdr.has(TCP_ACK) {
            return;
        }

        // ACK processing.
        if seq_gt(hdr.ack, tcb.snd_nxt) {
            // Acknowledges data we never sent.
            out.push(OutSeg::pure(tcb, TCP_ACK));
            return;
        }

        if tcb.state == TcpState::SynRcvd {
            if seq_gt(hdr.ack, tcb.snd_una) && seq_leq(hdr.ack, tcb.snd_nxt) {
                tcb.on_ack(hdr.ack, now);
                tcb.snd_wnd = hdr.window as u32;
                tcb.snd_wl1 = hdr.seq;
                tcb.snd_wl2 = hdr.ack;
                tcb.state = TcpState::Established;
                *established = true;
            } else {
                out.push(OutSeg {
                    local: tcb.local,
                    remote: tcb.remote,
                    seq: hdr.ack,
                    ack: 0,
                    flags: TCP_RST,
                    window: 0,
                    mss: None,
                    payload: Vec::new(),
                });
                return;
            }
        } else if seq_gt(hdr.ack, tcb.snd_una) {
            tcb.on_ack(hdr.ack, now);
            tcb.update_window(hdr.seq, hdr.ack, hdr.window as u32);
        } else if payload.is_empty()
            && !hdr.has(TCP_FIN)
            && hdr.ack == tcb.snd_una
            && !tcb.rtx_queue.is_empty()
        {
            if let Some(rtx) = tcb.on_dup_ack() {
                self.stats.tcp_fast_retransmits.inc();
                out.push(OutSeg {
                    local: tcb.local,
                    remote: tcb.remote,
                    seq: rtx.seq,
                    ack: tcb.rcv_nxt,
                    flags: rtx.flags,
                    window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
                    mss: None,
                    payload: rtx.payload,
                });
            }
        } else {
            tcb.update_window(hdr.seq, hdr.ack, hdr.window as u32);
        }

        let our_fin_acked = tcb.snd_una == tcb.snd_nxt;
        match tcb.state {
            TcpState::FinWait1 if our_fin_acked => tcb.state = TcpState::FinWait2,
            TcpState::Closing if our_fin_acked => {
                tcb.state = TcpState::TimeWait;
                tcb.time_wait_at = Some(now + TCP_TIME_WAIT);
            }
            TcpState::LastAck if our_fin_acked => {
                tcb.state = TcpState::Closed;
                *destroy = Some((tcb.local, tcb.remote));
                return;
            }
            _ => {}
        }

        // Payload processing: accept only data starting at rcv_nxt,
        // trimming an already-received prefix; fully out-of-order data
        // is dropped and the gap re-advertised.
        let fin_seq = hdr.seq.wrapping_add(payload.len() as u32);
        if !payload.is_empty()
            && matches!(
                tcb.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            if seq_leq(hdr.seq, tcb.rcv_nxt) {
                let skip = tcb.rcv_nxt.wrapping_sub(hdr.seq) as usize;
                if skip < payload.len() {
                    let fresh = &payload[skip..];
                    let mut q = sock.recv_q.lock().unwrap();
                    if q.push_stream(fresh) {
                        tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(fresh.len() as u32);
                        tcb.rcv_wnd = (TCP_RECV_WND as usize)
                            .saturating_sub(q.byte_count()) as u32;
                        drop(q);

                        // Cumulative ACK immediately for a meaningful
                        // payload, otherwise defer up to 200ms.
                        if fresh.len() >= tcb.mss as usize / 2 {
                            out.push(OutSeg::pure(tcb, TCP_ACK));
                            tcb.delack_at = None;
                        } else if tcb.delack_at.is_none() {
                            tcb.delack_at = Some(now + TCP_DELACK);
                        }
                    } else {
                        // Receive buffer overflow: drop without ACK
                        // progress.
                        self.stats.tcp_rcv_drops.inc();
                    }
                } else {
                    // Pure retransmission of old data.
                    out.push(OutSeg::pure(tcb, TCP_ACK));
                }
            } else {
                // Out-of-order: drop and re-ACK the expected sequence.
                self.stats.tcp_ooo_drops.inc();
                out.push(OutSeg::pure(tcb, TCP_ACK));
                return;
            }
        }

        // FIN processing.
        if hdr.has(TCP_FIN) && fin_seq == tcb.rcv_nxt {
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            out.push(OutSeg::pure(tcb, TCP_ACK));
            sock.recv_q.lock().unwrap().mark_eof();

            match tcb.state {
                TcpState::Established => {
                    tcb.state = TcpState::CloseWait;
                    let mut core = sock.core.lock().unwrap();
                    if core.state == SocketState::Connected {
                        core.state = SocketState::Disconnecting;
                    }
                }
                TcpState::FinWait1 => {
                    if our_fin_acked {
                        tcb.state = TcpState::TimeWait;
                        tcb.time_wait_at = Some(now + TCP_TIME_WAIT);
                    } else {
                        tcb.state = TcpState::Closing;
                    }
                }
                TcpState::FinWait2 => {
                    tcb.state = TcpState::TimeWait;
                    tcb.time_wait_at = Some(now + TCP_TIME_WAIT);
                }
                _ => {}
            }
        }
        // A FIN past rcv_nxt implies data was lost in between; the gap
        // will be retransmitted along with the FIN.
    }

    /// Promote a completed handshake to the socket layer
    fn tcp_on_established(&self, id: SocketId, sock: &Arc<Socket>) {
        let parent = {
            let mut core = sock.core.lock().unwrap();
            core.state = SocketState::Connected;
            core.parent
        };
        self.stats.tcp_established.inc();

        if let Some(parent_id) = parent {
            if let Ok(listener) = self.socket_get(parent_id) {
                listener.core.lock().unwrap().accept_queue.push_back(id);
            }
        }
    }

    /// Remove a connection from the lookup tables
    pub(crate) fn tcp_unregister(&self, id: SocketId, local: SocketAddrV4, remote: SocketAddrV4) {
        let mut reg = self.tcp.lock().unwrap();
        reg.conns
            .remove(&(*local.ip(), local.port(), *remote.ip(), remote.port()));
        if reg.bound.get(&(*local.ip(), local.port())) == Some(&id) {
            // Another connection may still share the local pair.
            let shared = reg
                .conns
                .iter()
                .any(|((ip, port, _, _), _)| *ip == *local.ip() && *port == local.port());
            if !shared && !reg.listeners.contains_key(&(*local.ip(), local.port())) {
                reg.bound.remove(&(*local.ip(), local.port()));
            }
        }
    }

    /// Transmit segments built under a control-block lock
    fn tcp_transmit(&self, segs: Vec<OutSeg>) {
        for seg in segs {
            let bytes = build_segment(
                *seg.local.ip(),
                *seg.remote.ip(),
                seg.local.port(),
                seg.remote.port(),
                seg.seq,
                seg.ack,
                seg.flags,
                seg.window,
                seg.mss,
                &seg.payload,
            );
            self.stats.tcp_out.inc();
            let _ = self.ip_output(
                Some(*seg.local.ip()),
                *seg.remote.ip(),
                IPPROTO_TCP,
                IP_DEFAULT_TTL,
                false,
                &bytes,
            );
        }
    }

    /// Timer sweep: retransmission, TIME_WAIT expiry, delayed ACKs,
    /// keepalive probes
    pub(crate) fn tcp_sweep(&self, now: Duration) {
        let sockets: Vec<(SocketId, Arc<Socket>)> = {
            self.sockets
                .read()
                .unwrap()
                .iter()
                .map(|(id, s)| (*id, s.clone()))
                .collect()
        };

        for (id, sock) in sockets {
            let mut out = Vec::new();
            let mut destroy: Option<(SocketAddrV4, SocketAddrV4)> = None;
            let mut sock_error: Option<KernelError> = None;

            {
                let mut guard = sock.tcb.lock().unwrap();
                let tcb = match guard.as_mut() {
                    Some(t) => t,
                    None => continue,
                };

                // TIME_WAIT expiry.
                if let Some(at) = tcb.time_wait_at {
                    if now >= at {
                        tcb.state = TcpState::Closed;
                        destroy = Some((tcb.local, tcb.remote));
                    }
                }

                // Retransmission timer.
                if destroy.is_none() {
                    if let Some(deadline) = tcb.rtx_deadline() {
                        if now >= deadline {
                            self.tcp_rto_fire(tcb, now, &mut out, &mut destroy, &mut sock_error);
                        }
                    }
                }

                // Delayed ACK.
                if destroy.is_none() {
                    if let Some(at) = tcb.delack_at {
                        if now >= at {
                            tcb.delack_at = None;
                            out.push(OutSeg::pure(tcb, TCP_ACK));
                        }
                    }
                }

                // Keepalive probing on idle established connections.
                if destroy.is_none()
                    && tcb.state == TcpState::Established
                    && sock.opts.lock().unwrap().keepalive
                    && tcb.rtx_queue.is_empty()
                {
                    let idle = now.saturating_sub(tcb.last_activity);
                    let due = TCP_KEEPALIVE_IDLE
                        + TCP_KEEPALIVE_INTVL * tcb.keepalive_probes;
                    if idle >= due {
                        if tcb.keepalive_probes >= TCP_KEEPALIVE_PROBES {
                            tcb.state = TcpState::Closed;
                            sock_error = Some(KernelError::Timeout);
                            destroy = Some((tcb.local, tcb.remote));
                        } else {
                            tcb.keepalive_probes += 1;
                            // Probe: one byte below snd_una forces an ACK.
                            out.push(OutSeg {
                                local: tcb.local,
                                remote: tcb.remote,
                                seq: tcb.snd_una.wrapping_sub(1),
                                ack: tcb.rcv_nxt,
                                flags: TCP_ACK,
                                window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
                                mss: None,
                                payload: Vec::new(),
                            });
                        }
                    }
                }
            }

            if let Some(err) = sock_error {
                let mut core = sock.core.lock().unwrap();
                core.error = Some(err);
                core.state = SocketState::Closed;
            }
            if let Some((local, remote)) = destroy {
                self.tcp_unregister(id, local, remote);
                self.socket_reap(id);
            }
            self.tcp_transmit(out);
        }
    }

    /// Retransmission timeout: back off, shrink the window, resend
    fn tcp_rto_fire(
        &self,
        tcb: &mut Tcb,
        now: Duration,
        out: &mut Vec<OutSeg>,
        destroy: &mut Option<(SocketAddrV4, SocketAddrV4)>,
        sock_error: &mut Option<KernelError>,
    ) {
        let is_syn = tcb
            .rtx_queue
            .front()
            .map(|s| s.flags & TCP_SYN != 0)
            .unwrap_or(false);
        let budget = if is_syn { TCP_SYN_RETRIES } else { TCP_DATA_RETRIES };

        let front = match tcb.rtx_queue.front_mut() {
            Some(f) => f,
            None => return,
        };
        if front.retries >= budget {
            tcb.state = TcpState::Closed;
            *sock_error = Some(KernelError::Timeout);
            *destroy = Some((tcb.local, tcb.remote));
            self.stats.tcp_rtx_failures.inc();
            return;
        }
        front.retries += 1;
        front.sent_at = now;
        let seg = front.clone();

        tcb.backoff = (tcb.backoff + 1).min(6);
        // Loss response: collapse to one segment and restart slow start.
        let mss = tcb.mss as u32;
        tcb.ssthresh = (tcb.cwnd / 2).max(2 * mss);
        tcb.cwnd = mss;
        tcb.in_fast_recovery = false;
        tcb.dup_acks = 0;
        self.stats.tcp_retransmits.inc();

        out.push(OutSeg {
            local: tcb.local,
            remote: tcb.remote,
            seq: seg.seq,
            ack: tcb.rcv_nxt,
            flags: seg.flags,
            window: tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            mss: if seg.flags & TCP_SYN != 0 { Some(tcb.mss) } else { None },
            payload: seg.payload,
        });
    }
}
