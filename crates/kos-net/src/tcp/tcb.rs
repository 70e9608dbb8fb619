//! TCP control block
//!
//! Per-connection send/receive state, congestion control, and the
//! retransmission queue. Every transmitted data segment stays queued here
//! until cumulatively acknowledged.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::Duration;

use super::wire::{seq_gt, seq_lt, TCP_FIN, TCP_SYN};

/// Default maximum segment size
pub const TCP_DEFAULT_MSS: u16 = 1460;

/// Initial congestion window, segments
pub const TCP_INIT_CWND_SEGS: u32 = 10;

/// Initial slow-start threshold
pub const TCP_DEFAULT_SSTHRESH: u32 = 64 * 1024;

/// Receive window cap
pub const TCP_RECV_WND: u32 = 64 * 1024 - 1;

/// Retransmission timer bounds
pub const TCP_RTO_INITIAL: Duration = Duration::from_secs(3);
pub const TCP_RTO_MIN: Duration = Duration::from_millis(200);
pub const TCP_RTO_MAX: Duration = Duration::from_secs(120);

/// TIME_WAIT lifetime
pub const TCP_TIME_WAIT: Duration = Duration::from_secs(30);

/// Delayed ACK deadline
pub const TCP_DELACK: Duration = Duration::from_millis(200);

/// Connection attempts before `connect` gives up
pub const TCP_SYN_RETRIES: u32 = 5;

/// Keepalive parameters (idle threshold, probe interval, probe budget)
pub const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(2 * 60 * 60);
pub const TCP_KEEPALIVE_INTVL: Duration = Duration::from_secs(75);
pub const TCP_KEEPALIVE_PROBES: u32 = 9;

/// Connection states per RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which sequence numbers have been exchanged both ways
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        write!(f, "{}", name)
    }
}

/// A transmitted, not yet cumulatively acknowledged segment
#[derive(Debug, Clone)]
pub struct TxSegment {
    pub seq: u32,
    /// Sequence space consumed (payload plus SYN/FIN)
    pub len: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
    pub sent_at: Duration,
    pub retries: u32,
}

/// Per-connection control block
pub struct Tcb {
    pub state: TcpState,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,

    // Send sequence space
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,

    // Receive sequence space
    pub irs: u32,
    pub rcv_nxt: u32,
    pub rcv_wnd: u32,

    pub mss: u16,

    // Congestion control
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_acks: u32,
    pub in_fast_recovery: bool,

    // Retransmission
    pub rtx_queue: VecDeque<TxSegment>,
    pub backoff: u32,
    pub srtt: Option<Duration>,
    pub rttvar: Duration,
    pub rto: Duration,

    // Timers
    pub time_wait_at: Option<Duration>,
    pub delack_at: Option<Duration>,
    pub last_activity: Duration,
    pub keepalive_probes: u32,

    /// Local close requested while data was still queued
    pub fin_pending: bool,
}

impl Tcb {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4, iss: u32, now: Duration) -> Self {
        let mss = TCP_DEFAULT_MSS;
        Tcb {
            state: TcpState::Closed,
            local,
            remote,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            irs: 0,
            rcv_nxt: 0,
            rcv_wnd: TCP_RECV_WND,
            mss,
            cwnd: TCP_INIT_CWND_SEGS * mss as u32,
            ssthresh: TCP_DEFAULT_SSTHRESH,
            dup_acks: 0,
            in_fast_recovery: false,
            rtx_queue: VecDeque::new(),
            backoff: 0,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: TCP_RTO_INITIAL,
            time_wait_at: None,
            delack_at: None,
            last_activity: now,
            keepalive_probes: 0,
            fin_pending: false,
        }
    }

    /// Bytes the sender may still put on the wire
    pub fn usable_window(&self) -> u32 {
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        let wnd = self.cwnd.min(self.snd_wnd);
        wnd.saturating_sub(in_flight)
    }

    /// Jacobson/Karels smoothing; the RTO moves monotonically with the
    /// measured samples and stays inside its clamp.
    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let err = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + err) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let rto = self.srtt.unwrap() + self.rttvar * 4;
        self.rto = rto.clamp(TCP_RTO_MIN, TCP_RTO_MAX);
    }

    /// Track a transmitted segment for retransmission
    pub fn track_segment(&mut self, seq: u32, flags: u8, payload: Vec<u8>, now: Duration) {
        let mut len = payload.len() as u32;
        if flags & TCP_SYN != 0 {
            len += 1;
        }
        if flags & TCP_FIN != 0 {
            len += 1;
        }
        if len == 0 {
            return; // pure ACKs are never retransmitted
        }
        self.rtx_queue.push_back(TxSegment {
            seq,
            len,
            flags,
            payload,
            sent_at: now,
            retries: 0,
        });
    }

    /// Process a cumulative ACK; returns newly acknowledged bytes
    pub fn on_ack(&mut self, ack: u32, now: Duration) -> u32 {
        if !seq_gt(ack, self.snd_una) {
            return 0;
        }
        let acked = ack.wrapping_sub(self.snd_una);
        self.snd_una = ack;
        self.backoff = 0;
        self.dup_acks = 0;

        // Drop fully acknowledged segments; sample RTT off a segment
        // that was transmitted exactly once (Karn's rule).
        while let Some(front) = self.rtx_queue.front() {
            let end = front.seq.wrapping_add(front.len);
            if seq_gt(end, ack) {
                break;
            }
            let seg = self.rtx_queue.pop_front().expect("front checked");
            if seg.retries == 0 {
                self.on_rtt_sample(now.saturating_sub(seg.sent_at));
            }
        }

        if self.in_fast_recovery {
            // New cumulative ACK ends recovery.
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
        } else if self.cwnd < self.ssthresh {
            // Slow start: one MSS per ACK of new data.
            self.cwnd += self.mss as u32;
        } else {
            // Congestion avoidance: MSS^2/cwnd per ACK.
            let mss = self.mss as u32;
            self.cwnd += (mss * mss / self.cwnd).max(1);
        }

        acked
    }

    /// Count a duplicate ACK; the third trips fast retransmit and the
    /// segment to resend is returned
    pub fn on_dup_ack(&mut self) -> Option<TxSegment> {
        self.dup_acks += 1;
        if self.in_fast_recovery {
            // Each further duplicate inflates the window by one segment.
            self.cwnd += self.mss as u32;
            return None;
        }
        if self.dup_acks == 3 {
            let mss = self.mss as u32;
            self.ssthresh = (self.cwnd / 2).max(2 * mss);
            self.cwnd = self.ssthresh + 3 * mss;
            self.in_fast_recovery = true;
            return self.rtx_queue.front().cloned();
        }
        None
    }

    /// Apply a window advertisement, refusing stale updates
    pub fn update_window(&mut self, seg_seq: u32, seg_ack: u32, seg_wnd: u32) {
        if seq_lt(self.snd_wl1, seg_seq)
            || (self.snd_wl1 == seg_seq && !seq_gt(self.snd_wl2, seg_ack))
        {
            self.snd_wnd = seg_wnd;
            self.snd_wl1 = seg_seq;
            self.snd_wl2 = seg_ack;
        }
    }

    /// Retransmission deadline of the oldest unacked segment
    pub fn rtx_deadline(&self) -> Option<Duration> {
        self.rtx_queue
            .front()
            .map(|seg| seg.sent_at + self.rto * (1 << self.backoff.min(6)))
    }

    /// An incoming segment is acceptable if it overlaps the receive
    /// window (RFC 793 acceptance test, simplified for whole segments)
    pub fn segment_acceptable(&self, seq: u32, seg_len: u32) -> bool {
        let wnd_end = self.rcv_nxt.wrapping_add(self.rcv_wnd);
        if seg_len == 0 {
            if self.rcv_wnd == 0 {
                return seq == self.rcv_nxt;
            }
            return !seq_lt(seq, self.rcv_nxt) && seq_lt(seq, wnd_end);
        }
        if self.rcv_wnd == 0 {
            return false;
        }
        let seg_end = seq.wrapping_add(seg_len).wrapping_sub(1);
        seq_lt(seq, wnd_end) && !seq_lt(seg_end, self.rcv_nxt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tcb() -> Tcb {
        let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1000);
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 2000);
        let mut t = Tcb::new(local, remote, 1_000_000, Duration::ZERO);
        t.state = TcpState::Established;
        t.snd_wnd = 65_000;
        t
    }

    #[test]
    fn test_initial_congestion_state() {
        let t = tcb();
        assert_eq!(t.cwnd, 10 * 1460);
        assert_eq!(t.ssthresh, 64 * 1024);
        assert_eq!(t.rto, Duration::from_secs(3));
    }

    #[test]
    fn test_slow_start_growth() {
        let mut t = tcb();
        t.snd_nxt = t.snd_una.wrapping_add(1460);
        t.track_segment(t.snd_una, 0x18, vec![0; 1460], Duration::ZERO);
        let before = t.cwnd;
        let acked = t.on_ack(t.snd_una.wrapping_add(1460), Duration::from_millis(50));
        assert_eq!(acked, 1460);
        assert_eq!(t.cwnd, before + 1460);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut t = tcb();
        t.cwnd = t.ssthresh; // leave slow start
        let before = t.cwnd;
        t.snd_nxt = t.snd_una.wrapping_add(100);
        let _ = t.on_ack(t.snd_una.wrapping_add(100), Duration::from_millis(10));
        let mss = t.mss as u32;
        assert_eq!(t.cwnd, before + (mss * mss / before).max(1));
    }

    #[test]
    fn test_fast_retransmit_on_third_dup() {
        let mut t = tcb();
        t.cwnd = 20_000;
        t.track_segment(t.snd_una, 0x18, vec![1; 1460], Duration::ZERO);
        t.snd_nxt = t.snd_una.wrapping_add(1460);

        assert!(t.on_dup_ack().is_none());
        assert!(t.on_dup_ack().is_none());
        let rtx = t.on_dup_ack().expect("third duplicate retransmits");
        assert_eq!(rtx.seq, t.snd_una);
        assert_eq!(t.ssthresh, 10_000);
        assert_eq!(t.cwnd, 10_000 + 3 * 1460);
        assert!(t.in_fast_recovery);

        // A new cumulative ACK deflates to ssthresh.
        let _ = t.on_ack(t.snd_una.wrapping_add(1460), Duration::from_millis(5));
        assert_eq!(t.cwnd, 10_000);
        assert!(!t.in_fast_recovery);
    }

    #[test]
    fn test_rtt_estimator_monotone_clamped() {
        let mut t = tcb();
        t.on_rtt_sample(Duration::from_millis(100));
        let rto_low = t.rto;
        t.on_rtt_sample(Duration::from_millis(400));
        assert!(t.rto >= rto_low);
        assert!(t.rto >= TCP_RTO_MIN && t.rto <= TCP_RTO_MAX);

        // Tiny samples clamp at the floor.
        let mut t2 = tcb();
        for _ in 0..20 {
            t2.on_rtt_sample(Duration::from_micros(10));
        }
        assert_eq!(t2.rto, TCP_RTO_MIN);
    }

    #[test]
    fn test_window_update_guard() {
        let mut t = tcb();
        t.snd_wl1 = 100;
        t.snd_wl2 = 50;
        t.snd_wnd = 8000;

        // Older seq: ignored.
        t.update_window(99, 60, 100);
        assert_eq!(t.snd_wnd, 8000);

        // Newer seq: applied.
        t.update_window(101, 60, 4000);
        assert_eq!(t.snd_wnd, 4000);

        // Same seq, newer ack: applied.
        t.update_window(101, 70, 2000);
        assert_eq!(t.snd_wnd, 2000);
    }

    #[test]
    fn test_snd_una_invariant() {
        let mut t = tcb();
        t.snd_nxt = t.snd_una.wrapping_add(5000);
        t.track_segment(t.snd_una, 0x18, vec![0; 5000], Duration::ZERO);
        t.on_ack(t.snd_una.wrapping_add(2000), Duration::from_millis(1));
        assert!(super::super::wire::seq_leq(t.snd_una, t.snd_nxt));
        assert_eq!(t.snd_nxt.wrapping_sub(t.snd_una), 3000);
    }
}
