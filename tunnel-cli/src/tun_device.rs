//! The real tun device: created, addressed and brought up via the `tun`
//! crate, registered for readiness with the same `mio` poll as the socket.
//!
//! What gets configured here mirrors the original C implementation's
//! tun-open-then-ifconfig sequence, re-expressed with the crate's builder
//! instead of raw ioctls.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use mio::unix::SourceFd;
use mio::{Interest, Poll, Token};
use tun::Device as _;

use tunnel_core::TunDevice;

pub struct Tun {
    inner: tun::platform::Device,
}

impl Tun {
    /// `address` is `ip/prefix`, e.g. `10.0.0.1/24`.
    pub fn create(name: &str, address: &str, mtu: usize, poll: &Poll, token: Token) -> io::Result<Self> {
        let (ip, prefix) = address
            .split_once('/')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address {address:?}, expected ip/prefix")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid prefix in {address:?}")))?;
        let netmask = prefix_to_netmask(prefix)?;

        let mut config = tun::Configuration::default();
        config
            .name(name)
            .address(ip)
            .netmask(netmask)
            .mtu(mtu as i32)
            .up();

        let mut inner = tun::create(&config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        inner.set_nonblock().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        poll.registry().register(&mut SourceFd(&inner.as_raw_fd()), token, Interest::READABLE)?;

        Ok(Self { inner })
    }
}

impl TunDevice for Tun {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }
}

fn prefix_to_netmask(prefix: u8) -> io::Result<std::net::Ipv4Addr> {
    if prefix > 32 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("prefix {prefix} out of range")));
    }
    let mask: u32 = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
    Ok(std::net::Ipv4Addr::from(mask))
}
