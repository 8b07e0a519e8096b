//! Randomizes the per-packet nonce and pads the datagram to resist passive
//! traffic analysis. Run on every outbound packet, right before encryption.

use rand::Rng;

use crate::packet::{Packet, MAX_PADDING};

pub struct Obfuscator {
    mtu: usize,
}

impl Obfuscator {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    /// Fill the nonce with fresh random bytes and append random padding,
    /// sized from the MTU headroom.
    pub fn obfuscate(&self, packet: &mut Packet) {
        let mut rng = rand::thread_rng();

        let mut nonce = [0u8; 8];
        rng.fill(&mut nonce);
        packet.set_nonce(nonce);

        let padding_len = self.padding_len(packet.len(), &mut rng);
        let mut padding = [0u8; MAX_PADDING];
        rng.fill(&mut padding[..padding_len]);
        packet.set_padding(&padding[..padding_len]);
    }

    /// Choose a padding length from a distribution that widens as headroom
    /// under the MTU shrinks, so padded packets don't cluster near a fixed
    /// size regardless of payload length.
    fn padding_len(&self, len: usize, rng: &mut impl Rng) -> usize {
        if len >= self.mtu {
            return 0;
        }
        let headroom = self.mtu - len;
        let padding = if headroom > 1000 {
            rng.gen_range(0..=250)
        } else if headroom > 500 {
            rng.gen_range(99..=349)
        } else if headroom > 200 {
            rng.gen_range(49..=199)
        } else {
            rng.gen_range(0..=198)
        };
        padding.min(headroom).min(MAX_PADDING)
    }
}
