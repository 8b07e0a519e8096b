//! Non-blocking UDP socket, registered with a `mio` poll so the reactor can
//! wait on it alongside the tun device.

use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use mio::{Interest, Poll, Token};

use tunnel_core::Socket;

pub struct UdpAdapter {
    inner: UdpSocket,
}

impl UdpAdapter {
    /// Bind (server) or connectless-bind-then-use (client) a non-blocking UDP
    /// socket and register it for readability with `poll` under `token`.
    pub fn bind(addr: SocketAddr, poll: &Poll, token: Token) -> io::Result<Self> {
        let mut inner = UdpSocket::bind(addr)?;
        poll.registry().register(&mut inner, token, Interest::READABLE)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Socket for UdpAdapter {
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, dst)
    }
}
