//! Netfilter hook points
//!
//! Five interception points along the packet pipeline, each an ordered
//! list of (priority, handler). Handlers are trait objects carrying
//! their own typed state. Any verdict other than `Accept` stops the
//! chain; `Repeat` restarts it, bounded so a misbehaving handler cannot
//! spin the stack forever.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use kos_core::error::{KernelError, KernelResult};
use kos_core::pktbuf::PacketBuffer;

use crate::NetStack;

/// Hook points in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    PreRouting,
    LocalIn,
    Forward,
    LocalOut,
    PostRouting,
}

impl Hook {
    pub const COUNT: usize = 5;

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Hook::PreRouting => 0,
            Hook::LocalIn => 1,
            Hook::Forward => 2,
            Hook::LocalOut => 3,
            Hook::PostRouting => 4,
        }
    }
}

/// Handler decision for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue along the chain
    Accept,
    /// Drop silently
    Drop,
    /// Handler took ownership of the packet's fate
    Stolen,
    /// Divert to the userspace-style queue
    Queue,
    /// Restart the chain
    Repeat,
}

/// IP-level summary handed to every handler
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub ifindex: u32,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
}

/// A packet inspection/mangling callback
pub trait NetfilterHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn hook(&self, hook: Hook, pkt: &mut PacketBuffer, meta: &PacketMeta) -> Verdict;
}

struct HookEntry {
    priority: i32,
    handler: Arc<dyn NetfilterHandler>,
}

/// Hook registration state; one lock per hook point
pub struct Netfilter {
    chains: [Mutex<Vec<HookEntry>>; Hook::COUNT],
    /// Packets diverted by the `Queue` verdict
    pub queue: SegQueue<PacketBuffer>,
}

/// Restarts a `Repeat` verdict may cause before the packet is dropped
const REPEAT_BUDGET: usize = 16;

impl Netfilter {
    pub fn new() -> Self {
        Netfilter {
            chains: Default::default(),
            queue: SegQueue::new(),
        }
    }

    /// Register a handler at a hook point; lower priority runs first
    pub fn register(
        &self,
        hook: Hook,
        priority: i32,
        handler: Arc<dyn NetfilterHandler>,
    ) -> KernelResult<()> {
        let mut chain = self.chains[hook.index()].lock().unwrap();
        if chain
            .iter()
            .any(|e| e.priority == priority && e.handler.name() == handler.name())
        {
            return Err(KernelError::AddressInUse);
        }
        chain.push(HookEntry { priority, handler });
        chain.sort_by_key(|e| e.priority);
        Ok(())
    }

    /// Remove a handler by name
    pub fn unregister(&self, hook: Hook, name: &str) -> KernelResult<()> {
        let mut chain = self.chains[hook.index()].lock().unwrap();
        let before = chain.len();
        chain.retain(|e| e.handler.name() != name);
        if chain.len() == before {
            return Err(KernelError::NotFound);
        }
        Ok(())
    }

    /// Snapshot the chain so handlers run without the hook lock held
    fn snapshot(&self, hook: Hook) -> Vec<Arc<dyn NetfilterHandler>> {
        self.chains[hook.index()]
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.handler.clone())
            .collect()
    }
}

impl Default for Netfilter {
    fn default() -> Self {
        Netfilter::new()
    }
}

impl NetStack {
    /// Run a packet through one hook chain
    ///
    /// Returns the verdict that ended the chain; `Queue` and `Stolen`
    /// both mean the caller no longer owns the packet's fate, and a
    /// queued packet is parked on the netfilter queue.
    pub(crate) fn netfilter_run(
        &self,
        hook: Hook,
        pkt: &mut PacketBuffer,
        meta: &PacketMeta,
    ) -> Verdict {
        let handlers = self.netfilter.snapshot(hook);
        if handlers.is_empty() {
            return Verdict::Accept;
        }

        let mut repeats = 0;
        'chain: loop {
            for handler in &handlers {
                match handler.hook(hook, pkt, meta) {
                    Verdict::Accept => continue,
                    Verdict::Repeat => {
                        repeats += 1;
                        if repeats > REPEAT_BUDGET {
                            log::warn!(
                                "netfilter: {} exceeded repeat budget, dropping",
                                handler.name()
                            );
                            return Verdict::Drop;
                        }
                        continue 'chain;
                    }
                    Verdict::Queue => {
                        let parked = std::mem::replace(pkt, PacketBuffer::alloc(0));
                        self.netfilter.queue.push(parked);
                        return Verdict::Queue;
                    }
                    other => return other,
                }
            }
            return Verdict::Accept;
        }
    }

    /// Register a netfilter handler
    pub fn netfilter_register(
        &self,
        hook: Hook,
        priority: i32,
        handler: Arc<dyn NetfilterHandler>,
    ) -> KernelResult<()> {
        self.netfilter.register(hook, priority, handler)
    }

    /// Remove a netfilter handler by name
    pub fn netfilter_unregister(&self, hook: Hook, name: &str) -> KernelResult<()> {
        self.netfilter.unregister(hook, name)
    }

    /// Take one packet off the QUEUE verdict queue
    pub fn netfilter_queue_pop(&self) -> Option<PacketBuffer> {
        self.netfilter.queue.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::stack_with_iface;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedVerdict {
        name: &'static str,
        verdict: Verdict,
        calls: AtomicUsize,
    }

    impl FixedVerdict {
        fn new(name: &'static str, verdict: Verdict) -> Arc<Self> {
            Arc::new(FixedVerdict { name, verdict, calls: AtomicUsize::new(0) })
        }
    }

    impl NetfilterHandler for FixedVerdict {
        fn name(&self) -> &'static str {
            self.name
        }

        fn hook(&self, _hook: Hook, _pkt: &mut PacketBuffer, _meta: &PacketMeta) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    fn meta() -> PacketMeta {
        PacketMeta {
            ifindex: 0,
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            protocol: 17,
        }
    }

    #[test]
    fn test_priority_order_and_short_circuit() {
        let (stack, _idx) = stack_with_iface("10.0.0.1");
        let first = FixedVerdict::new("dropper", Verdict::Drop);
        let second = FixedVerdict::new("never", Verdict::Accept);

        stack
            .netfilter_register(Hook::LocalIn, -10, first.clone())
            .unwrap();
        stack
            .netfilter_register(Hook::LocalIn, 10, second.clone())
            .unwrap();

        let mut pkt = PacketBuffer::from_slice(&[0u8; 20]);
        let verdict = stack.netfilter_run(Hook::LocalIn, &mut pkt, &meta());
        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        // The drop short-circuited before the second handler.
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_queue_parks_packet() {
        let (stack, _idx) = stack_with_iface("10.0.0.1");
        stack
            .netfilter_register(Hook::PreRouting, 0, FixedVerdict::new("q", Verdict::Queue))
            .unwrap();

        let mut pkt = PacketBuffer::from_slice(&[7u8; 9]);
        let verdict = stack.netfilter_run(Hook::PreRouting, &mut pkt, &meta());
        assert_eq!(verdict, Verdict::Queue);

        let parked = stack.netfilter_queue_pop().expect("packet parked");
        assert_eq!(parked.data(), &[7u8; 9]);
        assert!(stack.netfilter_queue_pop().is_none());
    }

    #[test]
    fn test_repeat_budget_bounds_loops() {
        let (stack, _idx) = stack_with_iface("10.0.0.1");
        let spinner = FixedVerdict::new("spinner", Verdict::Repeat);
        stack
            .netfilter_register(Hook::Forward, 0, spinner.clone())
            .unwrap();

        let mut pkt = PacketBuffer::from_slice(&[0u8; 4]);
        let verdict = stack.netfilter_run(Hook::Forward, &mut pkt, &meta());
        assert_eq!(verdict, Verdict::Drop);
        assert!(spinner.calls.load(Ordering::SeqCst) <= 20);
    }

    #[test]
    fn test_unregister() {
        let (stack, _idx) = stack_with_iface("10.0.0.1");
        stack
            .netfilter_register(Hook::LocalOut, 0, FixedVerdict::new("x", Verdict::Drop))
            .unwrap();
        stack.netfilter_unregister(Hook::LocalOut, "x").unwrap();
        assert_eq!(
            stack.netfilter_unregister(Hook::LocalOut, "x").err(),
            Some(KernelError::NotFound)
        );

        let mut pkt = PacketBuffer::from_slice(&[0u8; 4]);
        assert_eq!(
            stack.netfilter_run(Hook::LocalOut, &mut pkt, &meta()),
            Verdict::Accept
        );
    }
}
