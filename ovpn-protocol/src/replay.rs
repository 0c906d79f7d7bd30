//! Data-channel replay protection
//!
//! Sliding bitmap window over packet ids. Ids at or behind the left edge
//! are stale, duplicates inside the window are rejected, newer ids advance
//! the window.

use crate::{Error, Result};

/// Width of the acceptance window in packet ids
pub const REPLAY_WINDOW_SIZE: u32 = 128;

/// Sliding replay window for one receive direction
#[derive(Debug, Default)]
pub struct ReplayWindow {
    /// Highest packet id authenticated so far (0 = none yet)
    highest: u32,
    /// Bit `n` set means `highest - n` was seen
    bitmap: u128,
}

impl ReplayWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `packet_id` would be accepted, without mutating state
    pub fn check(&self, packet_id: u32) -> bool {
        if packet_id == 0 {
            return false;
        }
        if packet_id > self.highest {
            return true;
        }
        let behind = self.highest - packet_id;
        if behind >= REPLAY_WINDOW_SIZE {
            return false;
        }
        self.bitmap & (1u128 << behind) == 0
    }

    /// Record an authenticated `packet_id`, rejecting stale ids and
    /// duplicates. Call only after the packet passed authentication.
    pub fn check_and_update(&mut self, packet_id: u32) -> Result<()> {
        if packet_id == 0 {
            return Err(Error::ReplayedPacket(packet_id));
        }
        if packet_id > self.highest {
            let shift = packet_id - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = packet_id;
            return Ok(());
        }
        let behind = self.highest - packet_id;
        if behind >= REPLAY_WINDOW_SIZE {
            return Err(Error::ReplayedPacket(packet_id));
        }
        let bit = 1u128 << behind;
        if self.bitmap & bit != 0 {
            return Err(Error::ReplayedPacket(packet_id));
        }
        self.bitmap |= bit;
        Ok(())
    }
}
