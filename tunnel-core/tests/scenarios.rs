//! End-to-end scenarios against in-memory test-double adapters, driving the
//! same `Engine` the CLI binary runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tunnel_core::crypto::Crypto;
use tunnel_core::{Clock, Engine, EngineConfig, Mode, Socket, TunDevice};

const PSK: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd";

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

struct FakeClock(RefCell<Instant>);

impl FakeClock {
    fn new(now: Instant) -> Self {
        Self(RefCell::new(now))
    }

    fn advance(&self, d: Duration) {
        *self.0.borrow_mut() += d;
    }

    fn now(&self) -> Instant {
        *self.0.borrow()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.0.borrow()
    }
}

#[derive(Default)]
struct FakeTun {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<Vec<u8>>,
}

impl TunDevice for FakeTun {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.pop_front() {
            Some(datagram) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok(datagram.len())
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.push(buf.to_vec());
        Ok(buf.len())
    }
}

/// Connects a pair of fake sockets so sends on one land as receives on the
/// other. Captures every datagram handed to `send_to` in send order,
/// independent of delivery, so scenarios can inspect what went out even when
/// a datagram is never drained on the receiving side (simulated loss).
#[derive(Default)]
struct FakeWire {
    to_a: VecDeque<(Vec<u8>, SocketAddr)>,
    to_b: VecDeque<(Vec<u8>, SocketAddr)>,
    sent_by_a: Vec<Vec<u8>>,
    sent_by_b: Vec<Vec<u8>>,
}

struct FakeSocket {
    own_addr: SocketAddr,
    wire: Rc<RefCell<FakeWire>>,
    is_a: bool,
}

impl Socket for FakeSocket {
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut wire = self.wire.borrow_mut();
        let queue = if self.is_a { &mut wire.to_a } else { &mut wire.to_b };
        match queue.pop_front() {
            Some((datagram, from)) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok((datagram.len(), from))
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
        }
    }

    fn send_to(&mut self, buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if self.is_a {
            wire.sent_by_a.push(buf.to_vec());
            wire.to_b.push_back((buf.to_vec(), self.own_addr));
        } else {
            wire.sent_by_b.push(buf.to_vec());
            wire.to_a.push_back((buf.to_vec(), self.own_addr));
        }
        Ok(buf.len())
    }
}

struct Pair {
    client: Engine,
    client_sock: FakeSocket,
    server: Engine,
    server_sock: FakeSocket,
    wire: Rc<RefCell<FakeWire>>,
    clock: FakeClock,
}

fn client_server_pair(duplicate: bool, keepalive: Option<Duration>) -> Pair {
    let wire = Rc::new(RefCell::new(FakeWire::default()));
    let clock = FakeClock::new(Instant::now());

    let client_config = EngineConfig {
        mode: Mode::Client,
        mtu: 1400,
        duplicate,
        keepalive,
        peer: Some(addr(2)),
    };
    let server_config = EngineConfig {
        mode: Mode::Server,
        mtu: 1400,
        duplicate: false,
        keepalive: None,
        peer: None,
    };

    let client = Engine::new(client_config, PSK, &clock).unwrap();
    let server = Engine::new(server_config, PSK, &clock).unwrap();

    let client_sock = FakeSocket { own_addr: addr(1), wire: wire.clone(), is_a: true };
    let server_sock = FakeSocket { own_addr: addr(2), wire: wire.clone(), is_a: false };

    Pair { client, client_sock, server, server_sock, wire, clock }
}

/// Decrypt a captured on-wire datagram with the shared PSK, to inspect its
/// checksum or nonce from outside the engine.
fn decrypt(raw: &[u8]) -> tunnel_core::packet::Packet {
    let crypto = Crypto::new(PSK).unwrap();
    let mut packet = tunnel_core::packet::Packet::new();
    packet.buf_mut()[..raw.len()].copy_from_slice(raw);
    crypto.decrypt(&mut packet, raw.len()).unwrap();
    packet
}

#[test]
fn s1_heartbeat_round_trip_and_peer_learned() {
    let mut p = client_server_pair(false, Some(Duration::from_millis(1000)));
    let start = p.clock.now();

    let mut client_tun = FakeTun::default();
    let mut server_tun = FakeTun::default();

    // Ticks before the interval elapses must not emit a heartbeat.
    p.client.on_tick(start + Duration::from_millis(500), &mut p.client_sock).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 0);

    p.clock.advance(Duration::from_millis(1000));
    let now = p.clock.now();
    p.client.on_tick(now, &mut p.client_sock).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 1, "exactly one heartbeat emitted by the client");

    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();
    assert_eq!(p.wire.borrow().sent_by_b.len(), 1, "server replies with a heartbeat");
    assert_eq!(p.server.peer_addr(), Some(addr(1)), "server learns the client's source address");

    p.client.on_socket_ready(&mut p.client_sock, &mut client_tun).unwrap();
    assert!(client_tun.outbound.is_empty(), "heartbeats never reach the tun device");
}

#[test]
fn s2_single_packet_tunnel_delivers_and_schedules_an_ack() {
    let mut p = client_server_pair(false, None);
    let start = p.clock.now();

    let mut client_tun = FakeTun::default();
    client_tun.inbound.push_back(b"HELLO".to_vec());
    p.client.on_tun_ready(&mut client_tun, &mut p.client_sock, start).unwrap();

    let mut server_tun = FakeTun::default();
    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();

    assert_eq!(server_tun.outbound, vec![b"HELLO".to_vec()]);
    assert_eq!(p.server.peer_addr(), Some(addr(1)));

    p.clock.advance(Duration::from_millis(10));
    let now = p.clock.now();
    p.server.on_tick(now, &mut p.server_sock).unwrap();

    let sent = p.wire.borrow().sent_by_b.clone();
    assert_eq!(sent.len(), 2, "ack bundle is sent twice");
    for raw in &sent {
        let packet = decrypt(raw);
        assert!(packet.has_flag(tunnel_core::packet::flag::ACK_BUNDLE));
        assert_eq!(packet.len(), 4, "bundle carries exactly one checksum");
    }
}

#[test]
fn s3_loss_then_escalating_retransmit() {
    let mut p = client_server_pair(false, None);
    let t0 = p.clock.now();

    let mut client_tun = FakeTun::default();
    client_tun.inbound.push_back(vec![7u8; 100]);
    p.client.on_tun_ready(&mut client_tun, &mut p.client_sock, t0).unwrap();

    // First transmission is "lost": never drained from the wire queue, so it
    // never reaches the server, but it still counts as a send.
    assert_eq!(p.wire.borrow().sent_by_a.len(), 1);

    p.client.on_tick(t0 + Duration::from_millis(200), &mut p.client_sock).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 1 + 2);

    p.client.on_tick(t0 + Duration::from_millis(400), &mut p.client_sock).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 1 + 2 + 3);

    p.client.on_tick(t0 + Duration::from_millis(600), &mut p.client_sock).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 1 + 2 + 3 + 4, "10 total on-wire transmissions");

    // No further resend once retired.
    p.client.on_tick(t0 + Duration::from_millis(800), &mut p.client_sock).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 10);

    let sent = p.wire.borrow().sent_by_a.clone();
    let decoded: Vec<_> = sent.iter().map(|raw| decrypt(raw)).collect();
    let chksum = decoded[0].chksum();
    assert!(decoded.iter().all(|pk| pk.chksum() == chksum), "same chksum across every resend");

    let nonces: std::collections::HashSet<_> = decoded.iter().map(|pk| pk.nonce()).collect();
    assert_eq!(nonces.len(), decoded.len(), "every resend uses a fresh nonce");
}

#[test]
fn s4_dedup_under_triplication() {
    let mut p = client_server_pair(true, None);
    let now = p.clock.now();

    let mut client_tun = FakeTun::default();
    client_tun.inbound.push_back(vec![0u8; 200]);
    p.client.on_tun_ready(&mut client_tun, &mut p.client_sock, now).unwrap();
    assert_eq!(p.wire.borrow().sent_by_a.len(), 3, "triplicated send puts 3 copies on the wire");

    let mut server_tun = FakeTun::default();
    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();

    assert_eq!(server_tun.outbound.len(), 1, "triplicate sends must collapse to a single tun write");
}

#[test]
fn s5_piggyback_then_remaining_ack_queue() {
    let mut p = client_server_pair(false, None);
    let now = p.clock.now();

    let mut client_tun = FakeTun::default();
    let mut server_tun = FakeTun::default();

    // Seed the server with two received checksums, via two distinct inbound
    // client packets, before the server has anything of its own to send.
    client_tun.inbound.push_back(b"first".to_vec());
    p.client.on_tun_ready(&mut client_tun, &mut p.client_sock, now).unwrap();
    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();

    client_tun.inbound.push_back(b"second".to_vec());
    p.client.on_tun_ready(&mut client_tun, &mut p.client_sock, now).unwrap();
    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();

    p.wire.borrow_mut().sent_by_b.clear();

    // Server now has an outbound tun packet of its own to send.
    let mut server_tun_in = FakeTun::default();
    server_tun_in.inbound.push_back(b"reply".to_vec());
    p.server.on_tun_ready(&mut server_tun_in, &mut p.server_sock, now).unwrap();

    let sent = p.wire.borrow().sent_by_b.clone();
    assert_eq!(sent.len(), 1);
    let packet = decrypt(&sent[0]);
    assert!(packet.has_flag(tunnel_core::packet::flag::ACK), "outbound data packet piggybacks an ack");

    // Flush whatever remains; exactly one ack (the other, not-yet-piggybacked
    // checksum) should be bundled.
    p.wire.borrow_mut().sent_by_b.clear();
    p.server.on_tick(now + Duration::from_millis(10), &mut p.server_sock).unwrap();
    let flushed = p.wire.borrow().sent_by_b.clone();
    assert_eq!(flushed.len(), 2, "remaining single ack flushed as a bundle, sent twice");
    for raw in &flushed {
        let packet = decrypt(raw);
        assert_eq!(packet.len(), 4, "bundle carries exactly the one remaining checksum");
    }
}

#[test]
fn s6_server_follows_a_roaming_client() {
    let mut p = client_server_pair(false, None);
    let now = p.clock.now();

    let mut client_tun = FakeTun::default();
    client_tun.inbound.push_back(b"first".to_vec());
    p.client.on_tun_ready(&mut client_tun, &mut p.client_sock, now).unwrap();

    let mut server_tun = FakeTun::default();
    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();
    assert_eq!(p.server.peer_addr(), Some(addr(1)));

    // Client address changes (e.g. network roam); same wire, new socket addr.
    p.client_sock.own_addr = addr(3);

    let mut client_tun2 = FakeTun::default();
    client_tun2.inbound.push_back(b"second".to_vec());
    p.client.on_tun_ready(&mut client_tun2, &mut p.client_sock, now).unwrap();
    p.server.on_socket_ready(&mut p.server_sock, &mut server_tun).unwrap();

    assert_eq!(p.server.peer_addr(), Some(addr(3)));
}
