//! DNS resolver
//!
//! Stub resolver with a 256-entry cache keyed by the lowercased name.
//! Queries are standard RFC 1035 packets (recursion desired, one
//! question); reply parsing follows compression pointers with a bounded
//! jump budget so a malicious packet cannot loop the parser.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use kos_core::bytes::{ByteReader, ByteWriter};
use kos_core::error::{KernelError, KernelResult};

use crate::socket::{OptVal, AF_INET, SOCK_DGRAM, SO_RCVTIMEO};
use crate::NetStack;

/// Cache capacity
pub const DNS_CACHE_MAX: usize = 256;

/// TTL clamp and default
const DNS_TTL_MIN: Duration = Duration::from_secs(60);
const DNS_TTL_MAX: Duration = Duration::from_secs(86_400);
const DNS_TTL_DEFAULT: Duration = Duration::from_secs(300);

/// Configured servers tried in order
pub const DNS_MAX_SERVERS: usize = 4;

/// Compression pointer jump budget
const DNS_MAX_JUMPS: usize = 16;

/// Record type A, class IN
pub const DNS_TYPE_A: u16 = 1;
const DNS_CLASS_IN: u16 = 1;

const DNS_PORT: u16 = 53;
const DNS_QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// One cached resolution
#[derive(Debug, Clone, Copy)]
struct DnsCacheEntry {
    addr: Ipv4Addr,
    expires: Duration,
}

/// Resolver state behind the stack's dns lock
pub struct DnsResolver {
    cache: HashMap<(String, u16), DnsCacheEntry>,
    servers: Vec<Ipv4Addr>,
}

impl DnsResolver {
    pub fn new() -> Self {
        DnsResolver {
            cache: HashMap::new(),
            servers: Vec::new(),
        }
    }

    fn cache_put(&mut self, name: String, rtype: u16, addr: Ipv4Addr, ttl: Duration, now: Duration) {
        if self.cache.len() >= DNS_CACHE_MAX && !self.cache.contains_key(&(name.clone(), rtype)) {
            // Make room by dropping the entry closest to expiry.
            if let Some(victim) = self
                .cache
                .iter()
                .min_by_key(|(_, e)| e.expires)
                .map(|(k, _)| k.clone())
            {
                self.cache.remove(&victim);
            }
        }
        let ttl = ttl.clamp(DNS_TTL_MIN, DNS_TTL_MAX);
        self.cache
            .insert((name, rtype), DnsCacheEntry { addr, expires: now + ttl });
    }

    fn cache_get(&self, name: &str, rtype: u16, now: Duration) -> Option<Ipv4Addr> {
        self.cache
            .get(&(name.to_string(), rtype))
            .filter(|e| now < e.expires)
            .map(|e| e.addr)
    }

    fn expire(&mut self, now: Duration) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, e| now < e.expires);
        before - self.cache.len()
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        DnsResolver::new()
    }
}

/// Validate a hostname: label lengths, total length, charset
pub fn validate_hostname(name: &str) -> KernelResult<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(KernelError::InvalidArgument);
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(KernelError::InvalidArgument);
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(KernelError::InvalidArgument);
        }
    }
    Ok(())
}

/// Encode a name as length-prefixed labels
pub fn encode_dns_name(name: &str) -> KernelResult<Vec<u8>> {
    validate_hostname(name)?;
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(out)
}

/// Decode a possibly compressed name starting at `pos`
///
/// Returns the name and the offset just past its in-place encoding.
pub fn decode_dns_name(msg: &[u8], pos: usize) -> KernelResult<(String, usize)> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut end_after_jump: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(cursor).ok_or(KernelError::ProtocolError)? as usize;

        if len & 0xC0 == 0xC0 {
            // Compression pointer: two bytes, target in the low bits.
            let lo = *msg.get(cursor + 1).ok_or(KernelError::ProtocolError)? as usize;
            jumps += 1;
            if jumps > DNS_MAX_JUMPS {
                return Err(KernelError::ProtocolError);
            }
            if end_after_jump.is_none() {
                end_after_jump = Some(cursor + 2);
            }
            cursor = ((len & 0x3F) << 8) | lo;
            continue;
        }

        if len == 0 {
            cursor += 1;
            break;
        }
        if len > 63 || cursor + 1 + len > msg.len() {
            return Err(KernelError::ProtocolError);
        }
        if !name.is_empty() {
            name.push('.');
        }
        let label =
            std::str::from_utf8(&msg[cursor + 1..cursor + 1 + len]).map_err(|_| KernelError::ProtocolError)?;
        name.push_str(label);
        cursor += 1 + len;
        if name.len() > 255 {
            return Err(KernelError::ProtocolError);
        }
    }

    Ok((name, end_after_jump.unwrap_or(cursor)))
}

/// Build a standard query: header with RD set, one question
pub fn build_query(id: u16, name: &str, rtype: u16) -> KernelResult<Vec<u8>> {
    let encoded = encode_dns_name(name)?;
    let mut w = ByteWriter::with_capacity(12 + encoded.len() + 4);
    w.write_u16(id);
    w.write_u16(0x0100); // RD
    w.write_u16(1); // QDCOUNT
    w.write_u16(0);
    w.write_u16(0);
    w.write_u16(0);
    w.write_slice(&encoded);
    w.write_u16(rtype);
    w.write_u16(DNS_CLASS_IN);
    Ok(w.into_vec())
}

/// One parsed answer record
#[derive(Debug, Clone)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub ttl: Duration,
    pub addr: Ipv4Addr,
}

/// Parse a reply; returns its id and the A answers
pub fn parse_response(msg: &[u8]) -> KernelResult<(u16, Vec<DnsAnswer>)> {
    let mut r = ByteReader::new(msg);
    let id = r.read_u16()?;
    let flags = r.read_u16()?;
    if flags & 0x8000 == 0 {
        // Not a response.
        return Err(KernelError::ProtocolError);
    }
    let qdcount = r.read_u16()?;
    let ancount = r.read_u16()?;
    let _nscount = r.read_u16()?;
    let _arcount = r.read_u16()?;

    let mut pos = r.position();
    for _ in 0..qdcount {
        let (_, next) = decode_dns_name(msg, pos)?;
        pos = next + 4; // qtype + qclass
        if pos > msg.len() {
            return Err(KernelError::ProtocolError);
        }
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        let (name, next) = decode_dns_name(msg, pos)?;
        let mut rr = ByteReader::new(msg);
        rr.seek(next)?;
        let rtype = rr.read_u16()?;
        let _class = rr.read_u16()?;
        let ttl = rr.read_u32()?;
        let rdlen = rr.read_u16()? as usize;
        let rdata = rr.read_slice(rdlen)?;
        pos = rr.position();

        if rtype == DNS_TYPE_A && rdlen == 4 {
            answers.push(DnsAnswer {
                name: name.to_lowercase(),
                rtype,
                ttl: Duration::from_secs(u64::from(ttl)),
                addr: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]),
            });
        }
    }

    Ok((id, answers))
}

impl NetStack {
    /// Add a nameserver (at most four are kept)
    pub fn dns_add_server(&self, server: Ipv4Addr) -> KernelResult<()> {
        let mut dns = self.dns.lock().unwrap();
        if dns.servers.contains(&server) {
            return Ok(());
        }
        if dns.servers.len() >= DNS_MAX_SERVERS {
            return Err(KernelError::ResourceExhausted);
        }
        dns.servers.push(server);
        Ok(())
    }

    /// Drop all configured nameservers
    pub fn dns_clear_servers(&self) {
        self.dns.lock().unwrap().servers.clear();
    }

    /// Resolve a hostname to an IPv4 address
    ///
    /// Cache hits return immediately; otherwise each configured server
    /// is queried in turn over UDP.
    pub fn resolve(&self, name: &str) -> KernelResult<Ipv4Addr> {
        validate_hostname(name)?;
        let key = name.to_lowercase();
        let now = self.clock.now();

        if let Some(addr) = self.dns.lock().unwrap().cache_get(&key, DNS_TYPE_A, now) {
            self.stats.dns_cache_hits.inc();
            return Ok(addr);
        }

        let servers = self.dns.lock().unwrap().servers.clone();
        if servers.is_empty() {
            return Err(KernelError::NotFound);
        }

        for server in servers {
            match self.dns_query_server(server, &key) {
                Ok((addr, ttl)) => {
                    let now = self.clock.now();
                    self.dns
                        .lock()
                        .unwrap()
                        .cache_put(key.clone(), DNS_TYPE_A, addr, ttl, now);
                    return Ok(addr);
                }
                Err(err) => {
                    log::debug!("dns: server {} failed for {}: {}", server, key, err);
                }
            }
        }
        Err(KernelError::Timeout)
    }

    fn dns_query_server(&self, server: Ipv4Addr, name: &str) -> KernelResult<(Ipv4Addr, Duration)> {
        let id: u16 = rand::random();
        let query = build_query(id, name, DNS_TYPE_A)?;

        let sock = self.socket(AF_INET, SOCK_DGRAM, 0)?;
        let result = (|| {
            self.setsockopt(sock, SO_RCVTIMEO, OptVal::Time(DNS_QUERY_TIMEOUT))?;
            self.stats.dns_queries.inc();
            self.sendto(sock, &query, SocketAddrV4::new(server, DNS_PORT))?;

            let mut buf = [0u8; 512];
            loop {
                let (n, src) = self.recvfrom(sock, &mut buf)?;
                if *src.ip() != server {
                    continue;
                }
                let (reply_id, answers) = parse_response(&buf[..n])?;
                if reply_id != id {
                    continue;
                }
                let answer = answers
                    .into_iter()
                    .find(|a| a.rtype == DNS_TYPE_A)
                    .ok_or(KernelError::NotFound)?;
                let ttl = if answer.ttl.is_zero() { DNS_TTL_DEFAULT } else { answer.ttl };
                return Ok((answer.addr, ttl));
            }
        })();

        let _ = self.close(sock);
        result
    }

    /// Periodic cache cleanup
    pub(crate) fn dns_sweep(&self, now: Duration) {
        let removed = self.dns.lock().unwrap().expire(now);
        if removed > 0 {
            log::trace!("dns: expired {} cache entries", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let encoded = encode_dns_name("www.example.com").unwrap();
        assert_eq!(encoded[0], 3);
        assert_eq!(&encoded[1..4], b"www");
        let (name, next) = decode_dns_name(&encoded, 0).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(next, encoded.len());
    }

    #[test]
    fn test_hostname_validation() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("a-b_c.example.com").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("exa mple.com").is_err());
        assert!(validate_hostname(&"a".repeat(64)).is_err());
        assert!(validate_hostname(&format!("{}.com", "a".repeat(250))).is_err());
        assert!(validate_hostname("double..dot").is_err());
    }

    #[test]
    fn test_compression_pointer() {
        // "example.com" at offset 12, then a pointer to it.
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&encode_dns_name("example.com").unwrap());
        let ptr_at = msg.len();
        msg.extend_from_slice(&[0xC0, 12]);

        let (name, next) = decode_dns_name(&msg, ptr_at).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(next, ptr_at + 2);
    }

    #[test]
    fn test_pointer_loop_bounded() {
        // A pointer pointing at itself must fail, not spin.
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[0xC0, 12]);
        assert_eq!(
            decode_dns_name(&msg, 12).err(),
            Some(KernelError::ProtocolError)
        );
    }

    #[test]
    fn test_query_build_and_parse_response() {
        let query = build_query(0x1234, "host.test", DNS_TYPE_A).unwrap();
        assert_eq!(&query[0..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);

        // Craft a matching response with one A answer via compression.
        let mut w = ByteWriter::new();
        w.write_u16(0x1234);
        w.write_u16(0x8180);
        w.write_u16(1); // qd
        w.write_u16(1); // an
        w.write_u16(0);
        w.write_u16(0);
        w.write_slice(&encode_dns_name("host.test").unwrap());
        w.write_u16(DNS_TYPE_A);
        w.write_u16(DNS_CLASS_IN);
        w.write_slice(&[0xC0, 12]); // name pointer to the question
        w.write_u16(DNS_TYPE_A);
        w.write_u16(DNS_CLASS_IN);
        w.write_u32(600);
        w.write_u16(4);
        w.write_slice(&[10, 1, 2, 3]);

        let (id, answers) = parse_response(w.bytes()).unwrap();
        assert_eq!(id, 0x1234);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].addr, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(answers[0].name, "host.test");
        assert_eq!(answers[0].ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_cache_ttl_clamp_and_expiry() {
        let mut resolver = DnsResolver::new();
        let now = Duration::from_secs(100);

        // A 5-second TTL clamps up to the 60-second floor.
        resolver.cache_put(
            "short.test".into(),
            DNS_TYPE_A,
            Ipv4Addr::new(1, 1, 1, 1),
            Duration::from_secs(5),
            now,
        );
        assert!(resolver
            .cache_get("short.test", DNS_TYPE_A, now + Duration::from_secs(59))
            .is_some());
        assert!(resolver
            .cache_get("short.test", DNS_TYPE_A, now + Duration::from_secs(61))
            .is_none());

        // A week-long TTL clamps down to a day.
        resolver.cache_put(
            "long.test".into(),
            DNS_TYPE_A,
            Ipv4Addr::new(2, 2, 2, 2),
            Duration::from_secs(7 * 86_400),
            now,
        );
        assert!(resolver
            .cache_get("long.test", DNS_TYPE_A, now + Duration::from_secs(86_399))
            .is_some());
        assert!(resolver
            .cache_get("long.test", DNS_TYPE_A, now + Duration::from_secs(86_401))
            .is_none());

        assert_eq!(resolver.expire(now + Duration::from_secs(90_000)), 2);
    }
}
