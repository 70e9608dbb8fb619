//! IPv4 fragment reassembly
//!
//! Hole-descriptor algorithm (RFC 815): each entry tracks the byte ranges
//! of the original datagram not yet received. A fragment shrinks, splits,
//! or removes overlapping holes; bytes already received win over any
//! duplicate that arrives later. The datagram is complete when the hole
//! list is empty and the total length is known.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::ip::Ipv4Header;
use crate::NetStack;

/// Entries older than this are discarded
pub const REASM_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on concurrent reassembly entries
pub const REASM_MAX_ENTRIES: usize = 512;

/// Largest reassembled datagram payload
const REASM_MAX_LEN: usize = 65_535;

/// Flow key for a fragment group
pub type ReasmKey = (Ipv4Addr, Ipv4Addr, u16, u8);

/// A byte range `[first, last)` not yet received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    first: usize,
    last: usize,
}

struct ReasmEntry {
    holes: Vec<Hole>,
    data: Vec<u8>,
    /// Set once the final fragment (MF clear) arrives
    total_len: Option<usize>,
    created: Duration,
}

impl ReasmEntry {
    fn new(now: Duration) -> Self {
        ReasmEntry {
            // One hole covering everything we might ever receive.
            holes: vec![Hole { first: 0, last: REASM_MAX_LEN }],
            data: Vec::new(),
            total_len: None,
            created: now,
        }
    }

    /// Merge one fragment; returns the payload when complete
    fn add(&mut self, offset: usize, payload: &[u8], more_frags: bool) -> Option<Vec<u8>> {
        let frag_end = offset + payload.len();
        if frag_end > REASM_MAX_LEN {
            return None;
        }

        if !more_frags {
            // The final fragment pins the total length. A shorter claim
            // than data already received is a protocol violation; ignore
            // the packet rather than truncate.
            match self.total_len {
                Some(t) if t != frag_end => return None,
                _ => self.total_len = Some(frag_end),
            }
            // Everything past the end is no longer a hole.
            self.holes.retain(|h| h.first < frag_end);
            for h in self.holes.iter_mut() {
                if h.last > frag_end {
                    h.last = frag_end;
                }
            }
        }

        if self.data.len() < frag_end {
            self.data.resize(frag_end, 0);
        }

        // Walk the hole list; copy only bytes that land inside a hole so
        // duplicates resolve to the first-seen value.
        let mut next_holes = Vec::with_capacity(self.holes.len() + 1);
        for hole in self.holes.drain(..) {
            if frag_end <= hole.first || offset >= hole.last {
                next_holes.push(hole);
                continue;
            }
            let fill_from = offset.max(hole.first);
            let fill_to = frag_end.min(hole.last);
            self.data[fill_from..fill_to]
                .copy_from_slice(&payload[fill_from - offset..fill_to - offset]);

            if hole.first < fill_from {
                next_holes.push(Hole { first: hole.first, last: fill_from });
            }
            if fill_to < hole.last {
                next_holes.push(Hole { first: fill_to, last: hole.last });
            }
        }
        self.holes = next_holes;

        match self.total_len {
            Some(total) if self.holes.is_empty() => {
                let mut out = std::mem::take(&mut self.data);
                out.truncate(total);
                Some(out)
            }
            _ => None,
        }
    }
}

/// All in-progress reassemblies, used under the stack's reasm lock
#[derive(Default)]
pub struct ReassemblyTable {
    entries: HashMap<ReasmKey, ReasmEntry>,
}

impl ReassemblyTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NetStack {
    /// Feed one fragment in; returns the whole payload when it completes
    pub(crate) fn reasm_fragment(&self, hdr: &Ipv4Header, payload: &[u8]) -> Option<Vec<u8>> {
        let key: ReasmKey = (hdr.src, hdr.dst, hdr.id, hdr.protocol);
        let now = self.clock.now();

        let mut table = self.reasm.lock().unwrap();
        if !table.entries.contains_key(&key) && table.entries.len() >= REASM_MAX_ENTRIES {
            self.stats.ip_reasm_fails.inc();
            return None;
        }
        let entry = table
            .entries
            .entry(key)
            .or_insert_with(|| ReasmEntry::new(now));

        match entry.add(hdr.frag_offset(), payload, hdr.more_frags()) {
            Some(full) => {
                table.entries.remove(&key);
                self.stats.ip_reasm_ok.inc();
                Some(full)
            }
            None => None,
        }
    }

    /// Discard entries older than the reassembly timeout
    pub(crate) fn reasm_sweep(&self, now: Duration) {
        let mut table = self.reasm.lock().unwrap();
        let before = table.entries.len();
        table
            .entries
            .retain(|_, e| now.saturating_sub(e.created) < REASM_TIMEOUT);
        let dropped = before - table.entries.len();
        if dropped > 0 {
            self.stats.ip_reasm_fails.add(dropped as u64);
            log::trace!("reassembly: timed out {} entries", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ReasmEntry {
        ReasmEntry::new(Duration::ZERO)
    }

    #[test]
    fn test_in_order_assembly() {
        let mut e = entry();
        assert!(e.add(0, &[1; 8], true).is_none());
        assert!(e.add(8, &[2; 8], true).is_none());
        let full = e.add(16, &[3; 4], false).unwrap();
        assert_eq!(full.len(), 20);
        assert_eq!(&full[..8], &[1; 8]);
        assert_eq!(&full[8..16], &[2; 8]);
        assert_eq!(&full[16..], &[3; 4]);
    }

    #[test]
    fn test_reverse_order_assembly() {
        let mut e = entry();
        assert!(e.add(16, &[3; 4], false).is_none());
        assert!(e.add(8, &[2; 8], true).is_none());
        let full = e.add(0, &[1; 8], true).unwrap();
        assert_eq!(full.len(), 20);
        assert_eq!(&full[16..], &[3; 4]);
    }

    #[test]
    fn test_duplicate_bytes_first_seen_wins() {
        let mut e = entry();
        assert!(e.add(0, &[0xAA; 8], true).is_none());
        // Overlapping retransmission with different content.
        assert!(e.add(0, &[0xBB; 16], true).is_none());
        let full = e.add(16, &[0xCC; 4], false).unwrap();
        assert_eq!(&full[..8], &[0xAA; 8]);
        assert_eq!(&full[8..16], &[0xBB; 8]);
    }

    #[test]
    fn test_hole_split_by_middle_fragment() {
        let mut e = entry();
        assert!(e.add(8, &[2; 8], true).is_none());
        // Holes now: [0,8) and [16, MAX).
        assert!(e.add(0, &[1; 8], true).is_none());
        let full = e.add(16, &[3; 8], false).unwrap();
        assert_eq!(full.len(), 24);
    }

    #[test]
    fn test_total_len_conflict_ignored() {
        let mut e = entry();
        assert!(e.add(8, &[2; 8], false).is_none()); // claims total 16
        assert!(e.add(8, &[9; 16], false).is_none()); // claims total 24, ignored
        let full = e.add(0, &[1; 8], true).unwrap();
        assert_eq!(full.len(), 16);
    }
}
