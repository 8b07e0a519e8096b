//! The single-threaded packet engine: framing, crypto, reliability. Driven by
//! calling `on_tun_ready`, `on_socket_ready` and `on_tick` from a reactor
//! that owns the real tun fd, UDP socket and clock (see `tunnel-cli`).

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LE};
use tracing::{debug, instrument, trace, warn};

use crate::ack::AckQueue;
use crate::adapter::{Clock, Socket, TunDevice, TICK_INTERVAL};
use crate::crypto::Crypto;
use crate::dedup::Dedup;
use crate::error::EngineError;
use crate::obfuscate::Obfuscator;
use crate::packet::{flag, Packet, MAX_MTU, PACKET_CAP, PAYLOAD_OFFSET};
use crate::peer::PeerTracker;
use crate::retransmit::RetransmitTable;

/// Which end of the tunnel this engine is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// Configuration the engine itself consumes, as opposed to the CLI-only
/// collaborators (tun device naming, routing, NAT, privilege drop, log
/// level).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: Mode,
    pub mtu: usize,
    pub duplicate: bool,
    pub keepalive: Option<Duration>,
    /// The server's address, required in client mode. Ignored in server
    /// mode, where the peer starts unknown and is learned.
    pub peer: Option<SocketAddr>,
}

/// The packet engine. Carries no concrete I/O of its own: it is driven by a
/// reactor that calls into it when the tun device or socket are readable and
/// on a roughly-10ms tick.
pub struct Engine {
    config: EngineConfig,
    crypto: Crypto,
    obfuscator: Obfuscator,
    dedup: Dedup,
    acks: AckQueue,
    retransmit: RetransmitTable,
    peer: PeerTracker,
    last_ack_flush: Instant,
    last_keepalive: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig, psk: &str, clock: &impl Clock) -> Result<Self, EngineError> {
        let crypto = Crypto::new(psk)?;

        let peer = match config.mode {
            Mode::Client => {
                let addr = config.peer.ok_or_else(|| {
                    EngineError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "client mode requires a peer address",
                    ))
                })?;
                PeerTracker::pinned(addr)
            }
            Mode::Server => PeerTracker::roaming(),
        };

        let now = clock.now();
        Ok(Self {
            obfuscator: Obfuscator::new(config.mtu),
            dedup: Dedup::new(),
            acks: AckQueue::new(),
            retransmit: RetransmitTable::new(),
            peer,
            last_ack_flush: now,
            last_keepalive: now,
            crypto,
            config,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.current()
    }

    /// Drain every inner IP datagram currently available from `tun` and send
    /// each as a data packet to the current peer.
    #[instrument(level = "trace", skip_all)]
    pub fn on_tun_ready(
        &mut self,
        tun: &mut impl TunDevice,
        socket: &mut impl Socket,
        now: Instant,
    ) -> io::Result<()> {
        let mut buf = [0u8; MAX_MTU];
        loop {
            let n = match tun.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "tun read failed");
                    return Ok(());
                }
            };

            let Some(dst) = self.peer.current() else {
                // Server hasn't heard from a client yet; nothing to send to.
                trace!("dropping outbound datagram: peer not yet known");
                continue;
            };

            let mut packet = Packet::new();
            packet.set_payload(&buf[..n]);
            self.acks.piggyback(&mut packet);
            self.crypto.hash(&mut packet);

            let chksum = packet.chksum();
            self.retransmit.record(chksum, &packet, now);

            let copies = if self.config.duplicate { 3 } else { 1 };
            for _ in 0..copies {
                let mut copy = packet.clone();
                self.send_one(&mut copy, dst, socket)?;
            }
        }
    }

    /// Drain every UDP datagram currently available from `socket` and
    /// process each.
    #[instrument(level = "trace", skip_all)]
    pub fn on_socket_ready(
        &mut self,
        socket: &mut impl Socket,
        tun: &mut impl TunDevice,
    ) -> io::Result<()> {
        let mut buf = [0u8; PACKET_CAP];
        loop {
            let (n, from) = match socket.recv_from(&mut buf) {
                Ok(t) => t,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "socket recv failed");
                    return Ok(());
                }
            };

            if n < PAYLOAD_OFFSET {
                let err = crate::error::PacketError::TooShort { received: n };
                debug!(%from, error = %err, "dropping malformed packet");
                continue;
            }

            let mut packet = Packet::new();
            packet.buf_mut()[..n].copy_from_slice(&buf[..n]);

            if self.crypto.decrypt(&mut packet, n).is_err() {
                debug!(%from, "dropping packet: authentication failed");
                continue;
            }

            // Heartbeats bypass dedup: their authenticated region (flag 0,
            // len 0, empty payload) hashes identically every time, so a
            // checksum-keyed dedup table would treat every heartbeat after
            // the first as a duplicate.
            if packet.is_empty() && !packet.has_flag(flag::ACK_BUNDLE) {
                debug!(%from, "heartbeat received");
                if self.config.mode == Mode::Server {
                    self.peer.observe(from);
                    self.send_heartbeat(socket, from)?;
                }
                continue;
            }

            if self.dedup.check_and_insert(packet.chksum()) {
                trace!(%from, chksum = packet.chksum(), "dropping duplicate packet");
                continue;
            }

            if self.config.mode == Mode::Server {
                self.peer.observe(from);
            }

            if packet.has_flag(flag::ACK_BUNDLE) {
                for chunk in packet.payload().chunks_exact(4) {
                    self.retransmit.acknowledge(LE::read_u32(chunk));
                }
                continue;
            }

            if packet.has_flag(flag::ACK) {
                self.retransmit.acknowledge(packet.ack());
            }

            self.enqueue_ack(packet.chksum(), socket)?;

            if let Err(e) = tun.write(packet.payload()) {
                warn!(error = %e, "tun write failed, dropping packet");
            }
        }
    }

    /// Called roughly every 10ms by the reactor, whether or not the tun
    /// device or socket were ready. Drives the ack flush timer, the
    /// retransmit scan, and (client only) the keepalive heartbeat.
    #[instrument(level = "trace", skip_all)]
    pub fn on_tick(&mut self, now: Instant, socket: &mut impl Socket) -> io::Result<()> {
        if now.duration_since(self.last_ack_flush) >= TICK_INTERVAL {
            self.last_ack_flush = now;
            self.flush_acks(socket)?;
        }

        if let Some(dst) = self.peer.current() {
            for (_, copies, packet) in self.retransmit.due_for_resend(now) {
                for _ in 0..copies {
                    let mut copy = packet.clone();
                    self.send_one(&mut copy, dst, socket)?;
                }
            }
        }

        if self.config.mode == Mode::Client {
            if let Some(interval) = self.config.keepalive {
                if now.duration_since(self.last_keepalive) >= interval {
                    self.last_keepalive = now;
                    if let Some(dst) = self.peer.current() {
                        self.send_heartbeat(socket, dst)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn enqueue_ack(&mut self, chksum: u32, socket: &mut impl Socket) -> io::Result<()> {
        if self.acks.is_full() {
            self.flush_acks(socket)?;
        }
        self.acks.enqueue(chksum);
        Ok(())
    }

    fn flush_acks(&mut self, socket: &mut impl Socket) -> io::Result<()> {
        if self.acks.is_empty() {
            return Ok(());
        }

        let Some(dst) = self.peer.current() else {
            // Nothing to send to yet; drop the pending acks instead of
            // growing the queue forever.
            self.acks.drain();
            return Ok(());
        };

        let chksums = self.acks.drain();
        let mut payload = vec![0u8; chksums.len() * 4];
        for (i, c) in chksums.iter().enumerate() {
            LE::write_u32(&mut payload[i * 4..][..4], *c);
        }

        let mut packet = Packet::new();
        packet.set_payload(&payload);
        packet.set_flag(flag::ACK_BUNDLE);
        self.crypto.hash(&mut packet);

        // Ack bundles are always sent twice, independent of `duplicate`.
        let mut first = packet.clone();
        self.send_one(&mut first, dst, socket)?;
        self.send_one(&mut packet, dst, socket)?;
        Ok(())
    }

    fn send_heartbeat(&mut self, socket: &mut impl Socket, dst: SocketAddr) -> io::Result<()> {
        let mut packet = Packet::new();
        self.crypto.hash(&mut packet);
        self.send_one(&mut packet, dst, socket)
    }

    fn send_one(&mut self, packet: &mut Packet, dst: SocketAddr, socket: &mut impl Socket) -> io::Result<()> {
        self.obfuscator.obfuscate(packet);
        self.crypto.encrypt(packet);
        if let Err(e) = socket.send_to(packet.slice(), dst) {
            warn!(error = %e, %dst, "send failed");
        }
        Ok(())
    }
}
