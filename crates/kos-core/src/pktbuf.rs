//! Packet buffer
//!
//! A `PacketBuffer` is a byte arena with head/tail cursors so protocol
//! layers can prepend headers (`push`) and consume them (`pull`) without
//! copying the payload. Layer start positions are stored as byte indices,
//! never as pointers, so moving the buffer around is always safe.
//!
//! Invariant: `0 <= head <= tail <= capacity`, and every set layer offset
//! lies inside `[head, tail)`.

use std::time::Duration;

use crate::error::{KernelError, KernelResult};

/// Protocol layer tags for stored header offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Link header (Ethernet)
    L2,
    /// Network header (IPv4/IPv6)
    L3,
    /// Transport header (TCP/UDP/ICMP)
    L4,
    /// Application payload
    L7,
}

impl Layer {
    #[inline]
    fn index(self) -> usize {
        match self {
            Layer::L2 => 0,
            Layer::L3 => 1,
            Layer::L4 => 2,
            Layer::L7 => 3,
        }
    }
}

/// Contiguous byte store with head/tail cursors and per-layer offsets
pub struct PacketBuffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,

    /// Absolute byte index of each layer start, if set
    layers: [Option<usize>; 4],

    /// Interface index the packet arrived on
    pub ingress: Option<u32>,

    /// Receive or creation timestamp (kernel clock)
    pub timestamp: Duration,

    /// Subsystem-defined flag bits
    pub flags: u32,
}

impl PacketBuffer {
    /// Allocate an empty buffer of the given capacity
    pub fn alloc(capacity: usize) -> Self {
        PacketBuffer {
            data: vec![0u8; capacity],
            head: 0,
            tail: 0,
            layers: [None; 4],
            ingress: None,
            timestamp: Duration::ZERO,
            flags: 0,
        }
    }

    /// Allocate with initial headroom so lower layers can `push` headers
    ///
    /// Fails if the requested headroom does not fit the capacity.
    pub fn with_headroom(capacity: usize, headroom: usize) -> KernelResult<Self> {
        if headroom > capacity {
            return Err(KernelError::InvalidArgument);
        }
        let mut pkt = Self::alloc(capacity);
        pkt.head = headroom;
        pkt.tail = headroom;
        Ok(pkt)
    }

    /// Build a buffer holding a received frame, no headroom
    pub fn from_slice(frame: &[u8]) -> Self {
        let mut pkt = Self::alloc(frame.len());
        pkt.data[..frame.len()].copy_from_slice(frame);
        pkt.tail = frame.len();
        pkt
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.tail
    }

    /// The live bytes, `[head, tail)`
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }

    /// Append bytes at the tail
    pub fn put(&mut self, bytes: &[u8]) -> KernelResult<()> {
        if self.tail + bytes.len() > self.data.len() {
            return Err(KernelError::InvalidArgument);
        }
        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        Ok(())
    }

    /// Reserve `n` bytes at the head and return them for header writing
    pub fn push(&mut self, n: usize) -> KernelResult<&mut [u8]> {
        if self.head < n {
            return Err(KernelError::InvalidArgument);
        }
        self.head -= n;
        Ok(&mut self.data[self.head..self.head + n])
    }

    /// Advance the head past `n` consumed bytes
    ///
    /// Layer offsets that fall behind the new head are cleared, keeping
    /// the offset invariant intact.
    pub fn pull(&mut self, n: usize) -> KernelResult<()> {
        if self.head + n > self.tail {
            return Err(KernelError::InvalidArgument);
        }
        self.head += n;
        for slot in self.layers.iter_mut() {
            if let Some(off) = *slot {
                if off < self.head {
                    *slot = None;
                }
            }
        }
        Ok(())
    }

    /// Trim the buffer to `len` live bytes, dropping the excess tail
    pub fn truncate(&mut self, len: usize) -> KernelResult<()> {
        if len > self.len() {
            return Err(KernelError::InvalidArgument);
        }
        self.tail = self.head + len;
        for slot in self.layers.iter_mut() {
            if let Some(off) = *slot {
                if off >= self.tail {
                    *slot = None;
                }
            }
        }
        Ok(())
    }

    /// Record the current head as the start of `layer`
    ///
    /// A mark on an empty buffer clears the offset instead; an offset at
    /// `tail` would sit outside `[head, tail)`.
    pub fn mark_layer(&mut self, layer: Layer) {
        self.layers[layer.index()] = if self.head < self.tail {
            Some(self.head)
        } else {
            None
        };
    }

    /// Absolute offset of `layer`, if set
    pub fn layer_offset(&self, layer: Layer) -> Option<usize> {
        self.layers[layer.index()]
    }

    /// Bytes from the start of `layer` to the tail
    pub fn layer_slice(&self, layer: Layer) -> Option<&[u8]> {
        self.layers[layer.index()].map(|off| &self.data[off..self.tail])
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("capacity", &self.data.len())
            .field("ingress", &self.ingress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_push_pull_bounds() {
        let mut pkt = PacketBuffer::with_headroom(64, 16).unwrap();
        assert_eq!(pkt.headroom(), 16);

        pkt.put(&[1, 2, 3, 4]).unwrap();
        assert_eq!(pkt.len(), 4);
        assert_eq!(pkt.data(), &[1, 2, 3, 4]);

        // 16 bytes of headroom: a 20-byte push must fail
        assert!(pkt.push(20).is_err());

        let hdr = pkt.push(14).unwrap();
        hdr.copy_from_slice(&[0xAA; 14]);
        assert_eq!(pkt.len(), 18);

        pkt.pull(14).unwrap();
        assert_eq!(pkt.data(), &[1, 2, 3, 4]);

        // Pulling past the tail fails
        assert_eq!(pkt.pull(5), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_put_respects_capacity() {
        let mut pkt = PacketBuffer::alloc(4);
        pkt.put(&[0; 4]).unwrap();
        assert_eq!(pkt.put(&[0]), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_push_pull_restores_head() {
        let mut pkt = PacketBuffer::with_headroom(128, 32).unwrap();
        pkt.put(b"payload").unwrap();
        let before = pkt.headroom();
        pkt.push(20).unwrap();
        pkt.pull(20).unwrap();
        assert_eq!(pkt.headroom(), before);
        assert_eq!(pkt.data(), b"payload");
    }

    #[test]
    fn test_layer_offsets_follow_invariant() {
        let mut pkt = PacketBuffer::from_slice(&[0u8; 34]);
        pkt.mark_layer(Layer::L2);
        pkt.pull(14).unwrap();
        pkt.mark_layer(Layer::L3);

        // L2 is now behind the head and must be gone
        assert_eq!(pkt.layer_offset(Layer::L2), None);
        assert_eq!(pkt.layer_offset(Layer::L3), Some(14));
        assert_eq!(pkt.layer_slice(Layer::L3).unwrap().len(), 20);
    }

    #[test]
    fn test_truncate() {
        let mut pkt = PacketBuffer::from_slice(&[7u8; 40]);
        pkt.truncate(10).unwrap();
        assert_eq!(pkt.len(), 10);
        assert!(pkt.truncate(11).is_err());
    }
}
