//! Sliding-window bookkeeping for both transfer directions
//!
//! Sequence numbers are block offsets into the object. The sender tracks one
//! slot per in-flight block; the receiver tracks a presence bitmap above its
//! cumulative base. Acknowledgments carry the receiver's base plus a
//! selective bitmap of blocks received beyond it.

use std::collections::VecDeque;
use tokio::time::Instant;

/// Per-block slot on the sending side
#[derive(Debug, Clone, Copy, Default)]
struct SendSlot {
    sent_at: Option<Instant>,
    acked: bool,
}

/// Sender-side window over the blocks of one object
#[derive(Debug)]
pub struct SendWindow {
    base: u64,
    total: u64,
    window: usize,
    slots: VecDeque<SendSlot>,
}

impl SendWindow {
    /// Open a window at the given base; `total` is the object's block count
    pub fn new(base: u64, total: u64, window_size: u32) -> Self {
        let mut win = Self {
            base,
            total,
            window: window_size as usize,
            slots: VecDeque::new(),
        };
        win.refill();
        win
    }

    fn refill(&mut self) {
        while (self.slots.len() as u64) < self.window as u64
            && self.base + (self.slots.len() as u64) < self.total
        {
            self.slots.push_back(SendSlot::default());
        }
    }

    /// Lowest block not yet cumulatively acknowledged
    pub fn base(&self) -> u64 {
        self.base
    }

    /// True once every block has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.base >= self.total
    }

    /// Blocks in the window that have never been sent
    pub fn unsent(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sent_at.is_none() && !s.acked)
            .map(|(i, _)| self.base + i as u64)
            .collect()
    }

    /// Blocks sent but not yet acknowledged, the retransmission set
    pub fn outstanding(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sent_at.is_some() && !s.acked)
            .map(|(i, _)| self.base + i as u64)
            .collect()
    }

    /// Number of sent, unacknowledged blocks
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.sent_at.is_some() && !s.acked)
            .count()
    }

    /// Record the send time of a block
    pub fn mark_sent(&mut self, seq: u64, now: Instant) {
        if seq < self.base {
            return;
        }
        if let Some(slot) = self.slots.get_mut((seq - self.base) as usize) {
            slot.sent_at = Some(now);
        }
    }

    /// Fold in an acknowledgment; returns true when the base advanced
    ///
    /// `ack_base` is the receiver's cumulative base and `sack` a bitmap of
    /// blocks received beyond it, bit `i` standing for block `ack_base + i`.
    pub fn apply_ack(&mut self, ack_base: u64, sack: &[u8]) -> bool {
        let before = self.base;
        let ack_base = ack_base.min(self.total);
        while self.base < ack_base {
            self.slots.pop_front();
            self.base += 1;
        }
        self.refill();
        // bit i names block ack_base + i; a stale ack shifts against our base
        let shift = (self.base - ack_base) as usize;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let idx = i + shift;
            if sack
                .get(idx / 8)
                .map(|b| b >> (idx % 8) & 1 == 1)
                .unwrap_or(false)
            {
                slot.acked = true;
            }
        }
        // a stray bit on the base itself still advances the window
        while self.slots.front().map(|s| s.acked).unwrap_or(false) {
            self.slots.pop_front();
            self.base += 1;
        }
        self.refill();
        self.base > before
    }
}

/// Outcome of placing one incoming block into the receive window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Already acknowledged or already present in the window
    Duplicate,
    /// Beyond the current window, the sender is ahead of our acks
    OutOfWindow,
    /// Newly stored; lists the blocks that just became contiguous
    Stored {
        /// Run of blocks promoted past the base by this arrival, in order
        newly_ordered: Vec<u64>,
    },
}

/// Receiver-side window over the blocks of one object
#[derive(Debug)]
pub struct RecvWindow {
    base: u64,
    total: u64,
    window: usize,
    received: VecDeque<bool>,
}

impl RecvWindow {
    /// Open a window at the given base; `total` is the object's block count
    pub fn new(base: u64, total: u64, window_size: u32) -> Self {
        let mut win = Self {
            base,
            total,
            window: window_size as usize,
            received: VecDeque::new(),
        };
        win.refill();
        win
    }

    fn refill(&mut self) {
        while (self.received.len() as u64) < self.window as u64
            && self.base + (self.received.len() as u64) < self.total
        {
            self.received.push_back(false);
        }
    }

    /// Lowest block not yet received
    pub fn base(&self) -> u64 {
        self.base
    }

    /// True once every block has been received
    pub fn is_complete(&self) -> bool {
        self.base >= self.total
    }

    /// Place an incoming block
    pub fn insert(&mut self, seq: u64) -> Placement {
        if seq < self.base {
            return Placement::Duplicate;
        }
        let idx = (seq - self.base) as usize;
        match self.received.get_mut(idx) {
            None => Placement::OutOfWindow,
            Some(slot) if *slot => Placement::Duplicate,
            Some(slot) => {
                *slot = true;
                let mut newly_ordered = Vec::new();
                while self.received.front().copied().unwrap_or(false) {
                    self.received.pop_front();
                    newly_ordered.push(self.base);
                    self.base += 1;
                }
                self.refill();
                Placement::Stored { newly_ordered }
            }
        }
    }

    /// Selective-ack bitmap of blocks held beyond the base
    ///
    /// Bit `i` stands for block `base + i`; trailing zero bytes are trimmed
    /// and a fully-contiguous window yields an empty bitmap.
    pub fn sack_bytes(&self) -> Vec<u8> {
        let mut bits = vec![0u8; (self.received.len() + 7) / 8];
        for (i, &got) in self.received.iter().enumerate() {
            if got {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        while bits.last() == Some(&0) {
            bits.pop();
        }
        bits
    }
}
