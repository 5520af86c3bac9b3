//! Retransmit list and sliding-window accounting.
//!
//! A fixed ring of 256 slots keyed directly by sequence number. A slot holds
//! an unacknowledged outbound header from the moment it is transmitted until
//! a cumulative ack releases it or teardown clears the list. The live count
//! is maintained internally, so it always equals the number of occupied
//! slots.

use super::header::Header;
use super::seq;

/// 256-slot ring of outbound headers awaiting acknowledgment.
pub struct TxWindow {
    slots: Box<[Option<Header>]>,
    live: u32,
}

impl TxWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            slots: (0..256).map(|_| None).collect(),
            live: 0,
        }
    }

    /// Number of live (unacknowledged) entries.
    pub fn len(&self) -> u32 {
        self.live
    }

    /// True when no entries are outstanding.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store a header under its sequence number.
    pub fn insert(&mut self, sequence: u8, header: Header) {
        let slot = &mut self.slots[usize::from(sequence)];
        if slot.is_none() {
            self.live += 1;
        }
        *slot = Some(header);
    }

    /// Borrow the entry for a sequence, if it is live.
    pub fn get_mut(&mut self, sequence: u8) -> Option<&mut Header> {
        self.slots[usize::from(sequence)].as_mut()
    }

    /// Release one slot, returning its header if it was live.
    pub fn release(&mut self, sequence: u8) -> Option<Header> {
        let taken = self.slots[usize::from(sequence)].take();
        if taken.is_some() {
            self.live -= 1;
        }
        taken
    }

    /// Advance `prev_ack` up to `through`, releasing every slot in the
    /// cumulative-ack range `(prev_ack, through]`. Returns the number of
    /// entries released.
    pub fn release_range(&mut self, prev_ack: &mut u8, through: u8) -> u32 {
        let mut released = 0;
        for sequence in seq::range(*prev_ack, through) {
            if self.release(sequence).is_some() {
                released += 1;
            }
            *prev_ack = sequence;
        }
        released
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.live = 0;
    }
}

impl Default for TxWindow {
    fn default() -> Self {
        Self::new()
    }
}
