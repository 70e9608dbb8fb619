//! End-to-end stack scenarios over simulated links

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use kos_core::clock::Clock;
use kos_core::pktbuf::PacketBuffer;
use kos_net::socket::{AF_INET, SOCK_DGRAM, SOCK_STREAM};
use kos_net::{CtKey, CtState, LinkDriver, MacAddr, NetInterface, NetStack};

/// Driver that records every outbound frame
#[derive(Default)]
struct CaptureDriver {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl LinkDriver for CaptureDriver {
    fn send(&self, _iface: &NetInterface, frame: PacketBuffer) {
        self.frames.lock().unwrap().push(frame.data().to_vec());
    }
}

/// Driver that feeds frames straight into a peer stack
struct PipeDriver {
    peer: OnceLock<(Arc<NetStack>, u32)>,
}

impl LinkDriver for PipeDriver {
    fn send(&self, _iface: &NetInterface, frame: PacketBuffer) {
        if let Some((stack, ifindex)) = self.peer.get() {
            stack.input(*ifindex, PacketBuffer::from_slice(frame.data()));
        }
    }
}

struct Host {
    stack: Arc<NetStack>,
    ifindex: u32,
    addr: Ipv4Addr,
    mac: MacAddr,
}

fn host(last_octet: u8, mac_tail: u8) -> Host {
    let stack = Arc::new(NetStack::new(Arc::new(Clock::manual())));
    let mac = MacAddr([0x02, 0, 0, 0, 0, mac_tail]);
    let ifindex = stack.iface_add("eth0", mac, 1500).unwrap();
    stack.iface_up(ifindex).unwrap();

    let addr = Ipv4Addr::new(10, 0, 0, last_octet);
    let mask = Ipv4Addr::new(255, 255, 255, 0);
    stack.iface_by_index(ifindex).unwrap().configure(addr, mask);
    stack
        .route_add(Ipv4Addr::new(10, 0, 0, 0), mask, None, ifindex, 0, 0)
        .unwrap();
    Host { stack, ifindex, addr, mac }
}

fn wire(a: &Host, b: &Host) {
    let drv_a = Arc::new(PipeDriver { peer: OnceLock::new() });
    let drv_b = Arc::new(PipeDriver { peer: OnceLock::new() });
    drv_a.peer.set((b.stack.clone(), b.ifindex)).ok().unwrap();
    drv_b.peer.set((a.stack.clone(), a.ifindex)).ok().unwrap();
    a.stack.iface_by_index(a.ifindex).unwrap().set_driver(drv_a);
    b.stack.iface_by_index(b.ifindex).unwrap().set_driver(drv_b);
}

#[test]
fn udp_fragmentation_offsets_and_reassembly() {
    let sender = host(1, 0x0A);
    let receiver = host(2, 0x0B);

    // Sender captures its frames; the binding to the receiver's MAC is
    // preloaded so no ARP traffic mixes into the capture.
    let capture = Arc::new(CaptureDriver::default());
    sender
        .stack
        .iface_by_index(sender.ifindex)
        .unwrap()
        .set_driver(capture.clone());
    sender.stack.arp_add(receiver.addr, receiver.mac, false);

    // A 4000-byte datagram (payload + 8-byte UDP header) over MTU 1500.
    let payload: Vec<u8> = (0..3992u32).map(|i| (i % 251) as u8).collect();
    let sock = sender.stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    sender
        .stack
        .bind(sock, SocketAddrV4::new(sender.addr, 5000))
        .unwrap();
    sender
        .stack
        .sendto(sock, &payload, SocketAddrV4::new(receiver.addr, 9000))
        .unwrap();

    let frames = capture.frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 3);

    // Expected fragments: payloads 1480/1480/1040 at offsets 0/185/370,
    // more-fragments set on the first two only.
    let expect = [(1480usize, 0u16, true), (1480, 185, true), (1040, 370, false)];
    for (frame, (len, offset, more)) in frames.iter().zip(expect) {
        let ip = &frame[14..];
        let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        let flags_frag = u16::from_be_bytes([ip[6], ip[7]]);
        assert_eq!(total_len, 20 + len);
        assert_eq!(flags_frag & 0x1FFF, offset);
        assert_eq!(flags_frag & 0x2000 != 0, more);
    }

    // Feed the fragments to the receiver in reverse order.
    let rsock = receiver.stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    receiver
        .stack
        .bind(rsock, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9000))
        .unwrap();
    for frame in frames.iter().rev() {
        receiver
            .stack
            .input(receiver.ifindex, PacketBuffer::from_slice(frame));
    }

    let mut buf = vec![0u8; 4096];
    let (n, src) = receiver.stack.recvfrom(rsock, &mut buf).unwrap();
    assert_eq!(n, 3992);
    assert_eq!(&buf[..n], &payload[..]);
    assert_eq!(*src.ip(), sender.addr);
    assert_eq!(src.port(), 5000);
}

#[test]
fn arp_resolves_over_the_wire() {
    let a = host(1, 0x1A);
    let b = host(2, 0x1B);
    wire(&a, &b);

    // No preloaded binding: the first datagram parks on the ARP entry,
    // the reply flushes it out, and both sides learn each other.
    let tx = a.stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    let rx = b.stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    b.stack
        .bind(rx, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777))
        .unwrap();

    a.stack
        .sendto(tx, b"knock", SocketAddrV4::new(b.addr, 7777))
        .unwrap();

    assert_eq!(a.stack.arp_lookup(b.addr).unwrap(), b.mac);

    let mut buf = [0u8; 32];
    let (n, _) = b.stack.recvfrom(rx, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"knock");
}

#[test]
fn tcp_connect_transfer_close() {
    let client = host(1, 0x2A);
    let server = host(2, 0x2B);
    wire(&client, &server);

    let listener = server.stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    server
        .stack
        .bind(listener, SocketAddrV4::new(server.addr, 8080))
        .unwrap();
    server.stack.listen(listener, 16).unwrap();

    let sock = client.stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    client
        .stack
        .connect(sock, SocketAddrV4::new(server.addr, 8080))
        .unwrap();

    // The synchronous wire completes the handshake inside connect.
    let conn = server.stack.accept(listener).unwrap();

    client.stack.send(sock, b"hello from client").unwrap();
    let mut buf = [0u8; 64];
    let n = server.stack.recv(conn, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello from client");

    server.stack.send(conn, b"hello back").unwrap();
    let n = client.stack.recv(sock, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello back");

    // Closing the client sends FIN; the server sees end of stream.
    client.stack.close(sock).unwrap();
    let n = server.stack.recv(conn, &mut buf).unwrap();
    assert_eq!(n, 0);

    server.stack.close(conn).unwrap();
    server.stack.close(listener).unwrap();
}

#[test]
fn icmp_echo_round_trip() {
    let a = host(1, 0x3A);
    let b = host(2, 0x3B);
    wire(&a, &b);

    let replies_before = a.stack.stats.icmp_in.get();
    a.stack.ping(b.addr, 77, 1, b"abcdefgh").unwrap();

    // The echo reply came back synchronously over the wire.
    assert_eq!(a.stack.stats.icmp_in.get(), replies_before + 1);
    assert!(b.stack.stats.icmp_in.get() >= 1);
}

#[test]
fn conntrack_tracks_udp_flow() {
    let a = host(1, 0x4A);
    let b = host(2, 0x4B);
    wire(&a, &b);

    let tx = a.stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    a.stack
        .bind(tx, SocketAddrV4::new(a.addr, 4000))
        .unwrap();
    let rx = b.stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    b.stack
        .bind(rx, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4001))
        .unwrap();

    a.stack
        .sendto(tx, b"one way", SocketAddrV4::new(b.addr, 4001))
        .unwrap();

    let key = CtKey {
        protocol: 17,
        src: a.addr,
        src_port: 4000,
        dst: b.addr,
        dst_port: 4001,
    };
    assert_eq!(b.stack.conntrack_state(&key), Some(CtState::New));

    // Reply traffic graduates the flow.
    let mut buf = [0u8; 16];
    let (_, from) = b.stack.recvfrom(rx, &mut buf).unwrap();
    b.stack.sendto(rx, b"and back", from).unwrap();
    assert_eq!(b.stack.conntrack_state(&key), Some(CtState::Established));

    // Thirty idle seconds age the flow out.
    b.stack.clock.advance(Duration::from_secs(31));
    b.stack.sweep_now();
    assert_eq!(b.stack.conntrack_state(&key), None);
}

#[test]
fn tcp_retransmit_after_loss() {
    let client = host(1, 0x5A);
    let server = host(2, 0x5B);

    // Client side starts with a black-hole driver: the SYN is lost.
    let blackhole = Arc::new(CaptureDriver::default());
    client
        .stack
        .iface_by_index(client.ifindex)
        .unwrap()
        .set_driver(blackhole);
    client.stack.arp_add(server.addr, server.mac, false);

    let listener = server.stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    server
        .stack
        .bind(listener, SocketAddrV4::new(server.addr, 8080))
        .unwrap();
    server.stack.listen(listener, 4).unwrap();

    let sock = client.stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    client
        .stack
        .connect(sock, SocketAddrV4::new(server.addr, 8080))
        .unwrap();

    // Heal the link, then let the retransmission timer fire (initial
    // RTO is three seconds).
    wire(&client, &server);
    let before = client.stack.stats.tcp_retransmits.get();
    client.stack.clock.advance(Duration::from_millis(3100));
    client.stack.sweep_now();
    assert_eq!(client.stack.stats.tcp_retransmits.get(), before + 1);

    // The retransmitted SYN completed the handshake.
    let conn = server.stack.accept(listener);
    assert!(conn.is_ok());
}
