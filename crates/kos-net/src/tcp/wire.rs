//! TCP header codec and sequence arithmetic

use std::net::Ipv4Addr;

use kos_core::bytes::{checksum_add, checksum_finish, ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};

use crate::ip::IPPROTO_TCP;

/// Header flag bits
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

const TCP_HDR_MIN: usize = 20;
const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

/// Decoded TCP header
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes
    pub data_off: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    /// MSS option value when present (SYN segments)
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub fn parse(data: &[u8]) -> KernelResult<TcpHeader> {
        let mut r = ByteReader::new(data);
        let src_port = r.read_u16()?;
        let dst_port = r.read_u16()?;
        let seq = r.read_u32()?;
        let ack = r.read_u32()?;
        let off_flags = r.read_u16()?;
        let data_off = ((off_flags >> 12) as usize) * 4;
        let flags = (off_flags & 0x3F) as u8;
        let window = r.read_u16()?;
        let checksum = r.read_u16()?;
        let urgent = r.read_u16()?;

        if data_off < TCP_HDR_MIN || data_off > data.len() {
            return Err(KernelError::ProtocolError);
        }

        let mut mss = None;
        let mut opts = ByteReader::new(&data[TCP_HDR_MIN..data_off]);
        while opts.remaining() > 0 {
            match opts.read_u8()? {
                TCP_OPT_END => break,
                TCP_OPT_NOP => continue,
                kind => {
                    let len = opts.read_u8()? as usize;
                    if len < 2 || len - 2 > opts.remaining() {
                        return Err(KernelError::ProtocolError);
                    }
                    let body = opts.read_slice(len - 2)?;
                    if kind == TCP_OPT_MSS && body.len() == 2 {
                        mss = Some(u16::from_be_bytes([body[0], body[1]]));
                    }
                }
            }
        }

        Ok(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_off,
            flags,
            window,
            checksum,
            urgent,
            mss,
        })
    }

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Sequence space the segment occupies (payload plus SYN/FIN)
    pub fn seq_len(&self, payload_len: usize) -> u32 {
        let mut len = payload_len as u32;
        if self.has(TCP_SYN) {
            len += 1;
        }
        if self.has(TCP_FIN) {
            len += 1;
        }
        len
    }
}

/// Build a complete TCP segment with its checksum
///
/// An MSS option is attached when `mss` is given (SYN and SYN+ACK).
#[allow(clippy::too_many_arguments)]
pub fn build_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let opt_len = if mss.is_some() { 4 } else { 0 };
    let data_off = TCP_HDR_MIN + opt_len;

    let mut w = ByteWriter::with_capacity(data_off + payload.len());
    w.write_u16(src_port);
    w.write_u16(dst_port);
    w.write_u32(seq);
    w.write_u32(ack);
    w.write_u16((((data_off / 4) as u16) << 12) | flags as u16);
    w.write_u16(window);
    w.write_u16(0);
    w.write_u16(0);
    if let Some(mss) = mss {
        w.write_u8(TCP_OPT_MSS);
        w.write_u8(4);
        w.write_u16(mss);
    }
    w.write_slice(payload);

    let sum = tcp_checksum(src, dst, w.bytes());
    w.set_u16_at(16, sum).expect("fixed checksum offset");
    w.into_vec()
}

/// Pseudo-header checksum over a full segment (header plus payload)
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum = checksum_add(sum, &[0, IPPROTO_TCP]);
    sum = checksum_add(sum, &(segment.len() as u16).to_be_bytes());
    sum = checksum_add(sum, segment);
    checksum_finish(sum)
}

/// `a < b` in sequence space
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
#[inline]
pub fn seq_leq(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a > b` in sequence space
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

/// `a >= b` in sequence space
#[inline]
pub fn seq_geq(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_round_trip() {
        let seg = build_segment(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            32768,
            80,
            1000,
            2000,
            TCP_SYN | TCP_ACK,
            4096,
            Some(1460),
            &[],
        );
        let hdr = TcpHeader::parse(&seg).unwrap();
        assert_eq!(hdr.src_port, 32768);
        assert_eq!(hdr.dst_port, 80);
        assert_eq!(hdr.seq, 1000);
        assert_eq!(hdr.ack, 2000);
        assert!(hdr.has(TCP_SYN) && hdr.has(TCP_ACK));
        assert_eq!(hdr.mss, Some(1460));
        assert_eq!(hdr.data_off, 24);
    }

    #[test]
    fn test_checksum_self_verifies() {
        let src = Ipv4Addr::new(192, 168, 0, 1);
        let dst = Ipv4Addr::new(192, 168, 0, 2);
        let seg = build_segment(src, dst, 1, 2, 0, 0, TCP_ACK, 100, None, b"hello");
        // Recomputing over the stored checksum folds to zero.
        assert_eq!(tcp_checksum(src, dst, &seg), 0);
    }

    #[test]
    fn test_seq_arithmetic_wraps() {
        assert!(seq_lt(0xFFFF_FFF0, 0x10));
        assert!(seq_gt(0x10, 0xFFFF_FFF0));
        assert!(seq_leq(5, 5));
        assert!(seq_geq(0, 0xFFFF_FF00));
    }

    #[test]
    fn test_seq_len_counts_syn_fin() {
        let seg = build_segment(
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            1,
            2,
            0,
            0,
            TCP_SYN | TCP_FIN,
            0,
            None,
            b"ab",
        );
        let hdr = TcpHeader::parse(&seg).unwrap();
        assert_eq!(hdr.seq_len(2), 4);
    }
}
