//! Connection tracking
//!
//! A PRE_ROUTING netfilter handler that records flow liveness in a
//! 1024-bucket hash table keyed by the 5-tuple, capped at 4096 entries.
//! TCP flows are NEW on SYN and ESTABLISHED once an ACK is observed;
//! entries age out on protocol- and state-specific timeouts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kos_core::clock::Clock;
use kos_core::pktbuf::PacketBuffer;

use crate::ip::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::netfilter::{Hook, NetfilterHandler, PacketMeta, Verdict};
use crate::tcp::wire::{TCP_ACK, TCP_SYN};
use crate::NetStack;

/// Hash buckets in the tracking table
const CT_BUCKETS: usize = 1024;

/// Maximum tracked flows
pub const CT_MAX_ENTRIES: usize = 4096;

/// Timeouts by protocol and state
const CT_TCP_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const CT_TCP_TRANSIENT_TIMEOUT: Duration = Duration::from_secs(120);
const CT_UDP_TIMEOUT: Duration = Duration::from_secs(30);
const CT_ICMP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracked flow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtState {
    New,
    Established,
    Related,
    Invalid,
}

/// Directional flow key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtKey {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl CtKey {
    fn reversed(&self) -> CtKey {
        CtKey {
            protocol: self.protocol,
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }

    fn bucket(&self) -> usize {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        (h.finish() as usize) % CT_BUCKETS
    }
}

/// One tracked flow, stored in its original direction
struct CtEntry {
    key: CtKey,
    state: CtState,
    last_seen: Duration,
    packets: u64,
    bytes: u64,
}

impl CtEntry {
    fn timeout(&self) -> Duration {
        match (self.key.protocol, self.state) {
            (IPPROTO_TCP, CtState::Established) => CT_TCP_ESTABLISHED_TIMEOUT,
            (IPPROTO_TCP, _) => CT_TCP_TRANSIENT_TIMEOUT,
            (IPPROTO_UDP, _) => CT_UDP_TIMEOUT,
            (IPPROTO_ICMP, _) => CT_ICMP_TIMEOUT,
            _ => CT_UDP_TIMEOUT,
        }
    }
}

/// The tracking table, used under its own lock
pub struct ConnTrack {
    buckets: Vec<Vec<CtEntry>>,
    count: usize,
}

impl ConnTrack {
    pub fn new() -> Self {
        ConnTrack {
            buckets: (0..CT_BUCKETS).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn find_mut(&mut self, key: &CtKey) -> Option<(&mut CtEntry, bool)> {
        let bucket = key.bucket();
        if self.buckets[bucket].iter().any(|e| e.key == *key) {
            let entry = self.buckets[bucket]
                .iter_mut()
                .find(|e| e.key == *key)
                .expect("present");
            return Some((entry, false));
        }
        let rev = key.reversed();
        let bucket = rev.bucket();
        self.buckets[bucket]
            .iter_mut()
            .find(|e| e.key == rev)
            .map(|e| (e, true))
    }

    /// Record one packet for the flow; returns its tracked state
    pub fn update(&mut self, key: CtKey, tcp_flags: Option<u8>, len: usize, now: Duration) -> CtState {
        if let Some((entry, is_reply)) = self.find_mut(&key) {
            entry.last_seen = now;
            entry.packets += 1;
            entry.bytes += len as u64;
            // TCP graduates to ESTABLISHED once an ACK flows; other
            // protocols graduate on any reply traffic.
            if entry.state == CtState::New {
                let graduated = match tcp_flags {
                    Some(flags) => flags & TCP_ACK != 0,
                    None => is_reply,
                };
                if graduated {
                    entry.state = CtState::Established;
                }
            }
            return entry.state;
        }

        // First packet of a flow. A TCP flow must open with a bare SYN.
        if let Some(flags) = tcp_flags {
            if flags & TCP_SYN == 0 || flags & TCP_ACK != 0 {
                return CtState::Invalid;
            }
        }
        if self.count >= CT_MAX_ENTRIES {
            log::warn!("conntrack table full, flow not tracked");
            return CtState::Invalid;
        }

        let bucket = key.bucket();
        self.buckets[bucket].push(CtEntry {
            key,
            state: CtState::New,
            last_seen: now,
            packets: 1,
            bytes: len as u64,
        });
        self.count += 1;
        CtState::New
    }

    /// Current state of a flow, looked up in either direction
    pub fn state_of(&self, key: &CtKey) -> Option<CtState> {
        let direct = self.buckets[key.bucket()].iter().find(|e| e.key == *key);
        if let Some(e) = direct {
            return Some(e.state);
        }
        let rev = key.reversed();
        self.buckets[rev.bucket()]
            .iter()
            .find(|e| e.key == rev)
            .map(|e| e.state)
    }

    /// Age out expired flows
    pub fn expire(&mut self, now: Duration) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter_mut() {
            bucket.retain(|e| {
                let keep = now.saturating_sub(e.last_seen) < e.timeout();
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        self.count -= removed;
        removed
    }
}

impl Default for ConnTrack {
    fn default() -> Self {
        ConnTrack::new()
    }
}

/// The PRE_ROUTING hook wiring the table into the pipeline
pub struct ConntrackHook {
    table: Arc<Mutex<ConnTrack>>,
    clock: Arc<Clock>,
}

impl ConntrackHook {
    pub fn new(table: Arc<Mutex<ConnTrack>>, clock: Arc<Clock>) -> Self {
        ConntrackHook { table, clock }
    }
}

impl NetfilterHandler for ConntrackHook {
    fn name(&self) -> &'static str {
        "conntrack"
    }

    fn hook(&self, _hook: Hook, pkt: &mut PacketBuffer, meta: &PacketMeta) -> Verdict {
        let data = pkt.data();
        // The packet head sits at the IP header at both hook points.
        let ihl = ((data.first().copied().unwrap_or(0) & 0x0F) as usize) * 4;
        if data.len() < ihl + 4 {
            return Verdict::Accept;
        }
        // Only the first fragment carries transport ports.
        if data.len() >= 8 && u16::from_be_bytes([data[6], data[7]]) & 0x1FFF != 0 {
            return Verdict::Accept;
        }
        let l4 = &data[ihl..];

        let (src_port, dst_port, tcp_flags) = match meta.protocol {
            IPPROTO_TCP => {
                if l4.len() < 14 {
                    return Verdict::Accept;
                }
                let sp = u16::from_be_bytes([l4[0], l4[1]]);
                let dp = u16::from_be_bytes([l4[2], l4[3]]);
                (sp, dp, Some(l4[13] & 0x3F))
            }
            IPPROTO_UDP => {
                let sp = u16::from_be_bytes([l4[0], l4[1]]);
                let dp = u16::from_be_bytes([l4[2], l4[3]]);
                (sp, dp, None)
            }
            IPPROTO_ICMP => (0, 0, None),
            _ => return Verdict::Accept,
        };

        let key = CtKey {
            protocol: meta.protocol,
            src: meta.src,
            src_port,
            dst: meta.dst,
            dst_port,
        };
        let state = self
            .table
            .lock()
            .unwrap()
            .update(key, tcp_flags, data.len(), self.clock.now());
        log::trace!(
            "conntrack: {:?} {}:{} -> {}:{} proto {}",
            state,
            meta.src,
            src_port,
            meta.dst,
            dst_port,
            meta.protocol
        );
        Verdict::Accept
    }
}

impl NetStack {
    /// Flow state as tracked by conntrack
    pub fn conntrack_state(&self, key: &CtKey) -> Option<CtState> {
        self.conntrack.lock().unwrap().state_of(key)
    }

    /// Tracked flow count
    pub fn conntrack_len(&self) -> usize {
        self.conntrack.lock().unwrap().len()
    }

    /// Periodic ageing pass
    pub(crate) fn conntrack_sweep(&self, now: Duration) {
        let removed = self.conntrack.lock().unwrap().expire(now);
        if removed > 0 {
            log::trace!("conntrack: aged out {} flows", removed);
        }
    }
}
