//! Abstract I/O the engine is generic over. Concrete implementations live in
//! the CLI binary; in-memory test doubles live alongside the engine tests.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A tun/tap-like device carrying inner IP datagrams.
pub trait TunDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// A non-blocking UDP socket.
pub trait Socket {
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;
}

/// A monotonic clock, abstracted so the event loop can be driven by a fake
/// clock in tests.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// A [`Clock`] backed by [`std::time::Instant::now`].
#[derive(Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Target resolution of the engine's ack-flush and retransmit-scan timers.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);
