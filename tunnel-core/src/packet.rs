//! On-wire packet layout: `nonce | chksum | ack | flag | len | payload | padding`.
//!
//! Only `flag`, `len` and `payload` are covered by the keyed hash; `nonce`
//! and `padding` are never authenticated.

use std::fmt;

use byteorder::{ByteOrder, LE};

pub const NONCE_LEN: usize = 8;
pub const CHKSUM_LEN: usize = 4;
pub const ACK_LEN: usize = 4;
pub const FLAG_LEN: usize = 2;
pub const LEN_LEN: usize = 2;

/// Offset of the payload within the packet; also the fixed header size.
pub const PAYLOAD_OFFSET: usize = NONCE_LEN + CHKSUM_LEN + ACK_LEN + FLAG_LEN + LEN_LEN;

/// Upper bound on the inner payload this engine will ever carry.
pub const MAX_MTU: usize = 1500;
/// Upper bound on obfuscator padding, see `obfuscate::Obfuscator`.
pub const MAX_PADDING: usize = 350;
/// Capacity of the fixed on-wire buffer.
pub const PACKET_CAP: usize = PAYLOAD_OFFSET + MAX_MTU + MAX_PADDING;

/// Flag bits, stored little-endian in the `flag` field.
pub mod flag {
    /// The `ack` field carries a piggybacked checksum.
    pub const ACK: u16 = 0x0001;
    /// `payload` is a concatenation of 4-byte checksums, not an inner datagram.
    pub const ACK_BUNDLE: u16 = 0x0002;
}

/// A fixed-capacity on-wire packet buffer.
#[derive(Clone)]
pub struct Packet {
    inner: Box<Inner>,
}

#[derive(Clone)]
struct Inner {
    buf: [u8; PACKET_CAP],
    /// Total on-wire length: `PAYLOAD_OFFSET + len + padding`.
    wire_len: u32,
}

impl Packet {
    pub fn new() -> Self {
        Self {
            inner: Box::new(Inner {
                buf: [0; PACKET_CAP],
                wire_len: PAYLOAD_OFFSET as u32,
            }),
        }
    }

    #[inline]
    pub fn buf(&self) -> &[u8; PACKET_CAP] {
        &self.inner.buf
    }

    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8; PACKET_CAP] {
        &mut self.inner.buf
    }

    #[inline]
    pub fn wire_len(&self) -> usize {
        self.inner.wire_len as usize
    }

    /// Set the total on-wire length directly. Used after receiving a
    /// datagram, where `len` (the payload-length header field) is only
    /// known once the buffer has been decrypted.
    #[inline]
    pub fn set_wire_len(&mut self, len: usize) {
        assert!(len >= PAYLOAD_OFFSET && len <= PACKET_CAP);
        self.inner.wire_len = len as u32;
    }

    /// The full on-wire byte slice, ready to pass to a socket send/recv call.
    #[inline]
    pub fn slice(&self) -> &[u8] {
        &self.inner.buf[..self.wire_len()]
    }

    #[inline]
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        self.inner.buf[0..NONCE_LEN].try_into().unwrap()
    }

    #[inline]
    pub fn set_nonce(&mut self, nonce: [u8; NONCE_LEN]) {
        self.inner.buf[0..NONCE_LEN].copy_from_slice(&nonce);
    }

    #[inline]
    pub fn chksum(&self) -> u32 {
        LE::read_u32(&self.inner.buf[NONCE_LEN..NONCE_LEN + CHKSUM_LEN])
    }

    #[inline]
    pub fn set_chksum(&mut self, value: u32) {
        LE::write_u32(&mut self.inner.buf[NONCE_LEN..NONCE_LEN + CHKSUM_LEN], value);
    }

    #[inline]
    pub fn ack(&self) -> u32 {
        LE::read_u32(&self.inner.buf[12..16])
    }

    #[inline]
    pub fn set_ack(&mut self, value: u32) {
        LE::write_u32(&mut self.inner.buf[12..16], value);
    }

    #[inline]
    pub fn flag(&self) -> u16 {
        LE::read_u16(&self.inner.buf[16..18])
    }

    #[inline]
    pub fn set_flag(&mut self, value: u16) {
        LE::write_u16(&mut self.inner.buf[16..18], value);
    }

    #[inline]
    pub fn has_flag(&self, bits: u16) -> bool {
        self.flag() & bits == bits
    }

    #[inline]
    pub fn len(&self) -> usize {
        LE::read_u16(&self.inner.buf[18..PAYLOAD_OFFSET]) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the payload contents and length, resetting the wire length to
    /// `PAYLOAD_OFFSET + len` (i.e. no padding yet).
    pub fn set_payload(&mut self, data: &[u8]) {
        assert!(data.len() <= MAX_MTU);
        LE::write_u16(&mut self.inner.buf[18..PAYLOAD_OFFSET], data.len() as u16);
        self.inner.buf[PAYLOAD_OFFSET..][..data.len()].copy_from_slice(data);
        self.inner.wire_len = (PAYLOAD_OFFSET + data.len()) as u32;
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.inner.buf[PAYLOAD_OFFSET..][..self.len()]
    }

    /// The region covered by the keyed hash: `flag`, `len`, `payload`.
    /// Excludes `nonce`, `chksum` and the trailing padding.
    #[inline]
    pub fn authenticated_region(&self) -> &[u8] {
        &self.inner.buf[16..PAYLOAD_OFFSET + self.len()]
    }

    /// Append padding bytes right after the payload, growing the wire length.
    pub fn set_padding(&mut self, padding: &[u8]) {
        let start = PAYLOAD_OFFSET + self.len();
        assert!(start + padding.len() <= PACKET_CAP);
        self.inner.buf[start..][..padding.len()].copy_from_slice(padding);
        self.inner.wire_len = (start + padding.len()) as u32;
    }

    #[inline]
    pub fn padding_len(&self) -> usize {
        self.wire_len() - PAYLOAD_OFFSET - self.len()
    }

    /// Confirm the declared payload length fits within `received` bytes.
    /// Must be called only after decryption, since `len` is itself
    /// encrypted on the wire.
    pub fn check_len_bound(&self, received: usize) -> Result<(), crate::error::PacketError> {
        let declared = PAYLOAD_OFFSET + self.len();
        if declared > received {
            return Err(crate::error::PacketError::LenOverflow { declared, received });
        }
        Ok(())
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("chksum", &format_args!("{:08X}", self.chksum()))
            .field("flag", &format_args!("{:04X}", self.flag()))
            .field("len", &self.len())
            .field("wire_len", &self.wire_len())
            .finish()
    }
}
