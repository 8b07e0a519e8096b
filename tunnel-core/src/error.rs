//! Error types for the packet engine.
//!
//! Packet-scoped errors ([`PacketError`], [`CryptoError`]) are always handled
//! locally by the engine (logged, packet dropped) and never escape
//! `Engine::on_socket_ready`/`on_tun_ready` as a `Result::Err`. Only setup
//! failures ([`EngineError`]) propagate out of `Engine::new`.

use thiserror::Error;

/// Rejection reasons for a just-received on-wire buffer, before decryption.
#[derive(Debug, Clone, Error)]
pub enum PacketError {
    #[error("packet too short to contain a header: got {received} bytes")]
    TooShort { received: usize },
    #[error("declared payload length {declared} overflows received buffer of {received} bytes")]
    LenOverflow { declared: usize, received: usize },
}

/// Failures from the crypto envelope.
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("pre-shared key must decode to a non-empty byte string")]
    InvalidKey,
}

/// Failures that abort engine setup or the event loop itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
