//! The crypto envelope: a keyed hash doubles as both the packet's
//! authentication tag and the seed for its per-packet stream-cipher key, so
//! an attacker without the pre-shared key can forge neither.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::packet::{Packet, NONCE_LEN};

const CHKSUM_CONTEXT: &[u8] = b"tunnel packet chksum";
const STREAM_KEY_CONTEXT: &[u8] = b"tunnel packet stream key";

/// Normalizes a pre-shared key and derives per-packet authentication and
/// encryption material from it. The key is the only state; cloning is cheap.
#[derive(Clone)]
pub struct Crypto {
    key: Zeroizing<[u8; 32]>,
}

impl Crypto {
    /// A 64-character hex string is decoded directly into the 32-byte key;
    /// anything else is expanded with a plain hash so short or non-hex keys
    /// still yield full key material.
    pub fn new(psk: &str) -> Result<Self, CryptoError> {
        if psk.is_empty() {
            return Err(CryptoError::InvalidKey);
        }

        let key = if psk.len() == 64 && psk.bytes().all(|b| b.is_ascii_hexdigit()) {
            let mut out = [0u8; 32];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&psk[i * 2..i * 2 + 2], 16)
                    .map_err(|_| CryptoError::InvalidKey)?;
            }
            out
        } else {
            *blake3::hash(psk.as_bytes()).as_bytes()
        };

        Ok(Self { key: Zeroizing::new(key) })
    }

    /// Compute the keyed hash over the authenticated region and store it in
    /// the packet's `chksum` field. Independent of `nonce` and padding.
    pub fn hash(&self, packet: &mut Packet) {
        let digest = blake3::Hasher::new_keyed(&self.key)
            .update(CHKSUM_CONTEXT)
            .update(packet.authenticated_region())
            .finalize();
        packet.set_chksum(u32::from_le_bytes(digest.as_bytes()[..4].try_into().unwrap()));
    }

    /// Encrypt in place, from just after the nonce to the end of the
    /// (already obfuscated) wire buffer.
    pub fn encrypt(&self, packet: &mut Packet) {
        let nonce = packet.nonce();
        let wire_len = packet.wire_len();
        let mut cipher = self.stream_for(&nonce);
        cipher.apply_keystream(&mut packet.buf_mut()[NONCE_LEN..wire_len]);
    }

    /// Decrypt in place and verify the authentication tag. `received_len` is
    /// the number of bytes actually read off the wire for this datagram.
    pub fn decrypt(&self, packet: &mut Packet, received_len: usize) -> Result<(), CryptoError> {
        let nonce = packet.nonce();
        let mut cipher = self.stream_for(&nonce);
        cipher.apply_keystream(&mut packet.buf_mut()[NONCE_LEN..received_len]);

        if packet.check_len_bound(received_len).is_err() {
            return Err(CryptoError::AuthenticationFailed);
        }
        packet.set_wire_len(received_len);

        let digest = blake3::Hasher::new_keyed(&self.key)
            .update(CHKSUM_CONTEXT)
            .update(packet.authenticated_region())
            .finalize();
        let expected = u32::from_le_bytes(digest.as_bytes()[..4].try_into().unwrap());

        if expected != packet.chksum() {
            return Err(CryptoError::AuthenticationFailed);
        }

        Ok(())
    }

    /// Derive a stream cipher keyed by (PSK, nonce). The key already differs
    /// on every packet, so a fixed zero IV is safe here: only the (key, IV)
    /// pair needs to be unique, and the key already is.
    fn stream_for(&self, nonce: &[u8; NONCE_LEN]) -> ChaCha20 {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(STREAM_KEY_CONTEXT);
        hasher.update(nonce);

        let mut stream_key = [0u8; 32];
        hasher.finalize_xof().fill(&mut stream_key);

        let key = chacha20::Key::from(stream_key);
        let iv = chacha20::Nonce::from([0u8; 12]);
        ChaCha20::new(&key, &iv)
    }
}
