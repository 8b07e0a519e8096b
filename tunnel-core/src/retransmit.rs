//! Fixed-capacity table of unacknowledged outbound packets, resent on an
//! escalating schedule until retired.

use std::time::{Duration, Instant};

use crate::packet::Packet;

pub const SLOTS: usize = 1021;
pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);
pub const MAX_ATTEMPTS: u8 = 4;

struct Slot {
    in_use: bool,
    chksum: u32,
    attempts: u8,
    last_send: Instant,
    packet: Packet,
}

/// Tracks outbound packets until they are acknowledged or retired. A linear
/// scan over the fixed table runs once per 10ms tick and once per inbound
/// ack, both bounded by link rate, so it stays cheap despite not being
/// indexed by checksum.
pub struct RetransmitTable {
    slots: Box<[Slot; SLOTS]>,
}

impl RetransmitTable {
    pub fn new() -> Self {
        let now = Instant::now();
        let slots: Vec<Slot> = (0..SLOTS)
            .map(|_| Slot {
                in_use: false,
                chksum: 0,
                attempts: 0,
                last_send: now,
                packet: Packet::new(),
            })
            .collect();
        let slots: Box<[Slot; SLOTS]> = slots
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_: Box<[Slot]>| unreachable!("SLOTS entries were just collected"));
        Self { slots }
    }

    /// Record a freshly sent outbound packet, allocating a slot if one is
    /// free. `packet` should hold only the authenticated region (no
    /// nonce/padding yet): those are regenerated fresh on every resend.
    /// Returns whether a slot was allocated; if not, the packet still went
    /// out once but will not be retransmitted.
    pub fn record(&mut self, chksum: u32, packet: &Packet, now: Instant) -> bool {
        match self.slots.iter_mut().find(|s| !s.in_use) {
            Some(slot) => {
                slot.in_use = true;
                slot.chksum = chksum;
                slot.attempts = 1;
                slot.last_send = now;
                slot.packet = packet.clone();
                true
            }
            None => false,
        }
    }

    /// Free the slot holding `chksum`, if any. A no-op if absent; repeated
    /// calls for the same checksum are idempotent.
    pub fn acknowledge(&mut self, chksum: u32) {
        for slot in self.slots.iter_mut() {
            if slot.in_use && slot.chksum == chksum {
                slot.in_use = false;
                break;
            }
        }
    }

    /// Scan for entries due for resend. Each due entry is returned with its
    /// new attempt count (the number of copies to send) and a clone of its
    /// stored packet; the slot is retired once its attempt count reaches
    /// [`MAX_ATTEMPTS`].
    pub fn due_for_resend(&mut self, now: Instant) -> Vec<(u32, u8, Packet)> {
        let mut due = Vec::new();
        for slot in self.slots.iter_mut() {
            if !slot.in_use || now.duration_since(slot.last_send) < RETRY_INTERVAL {
                continue;
            }
            slot.attempts += 1;
            slot.last_send = now;
            due.push((slot.chksum, slot.attempts, slot.packet.clone()));
            if slot.attempts >= MAX_ATTEMPTS {
                slot.in_use = false;
            }
        }
        due
    }

    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}
