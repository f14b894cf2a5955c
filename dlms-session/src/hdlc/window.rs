//! HDLC window management and retransmission
//!
//! Sequence variables use strict modulo arithmetic. The number of
//! unacknowledged I-frames never exceeds `min(modulus - 1, window size)`.

use std::collections::VecDeque;

/// One piece of an upper-layer payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub data: Vec<u8>,
    /// Final segment of its payload; travels with the segmentation bit cleared
    pub last: bool,
}

/// I-frame sent but not yet acknowledged
#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub ns: u8,
    pub segment: Segment,
}

/// Send window: V(S) and the unacknowledged queue
#[derive(Debug)]
pub struct SendWindow {
    unacked: VecDeque<PendingFrame>,
    modulus: u8,
    max_outstanding: usize,
    next_sequence: u8,
}

impl SendWindow {
    pub fn new(modulus: u8, window_size: u32) -> Self {
        let max_outstanding = (modulus as usize - 1).min(window_size.max(1) as usize);
        Self {
            unacked: VecDeque::new(),
            modulus,
            max_outstanding,
            next_sequence: 0,
        }
    }

    /// V(S)
    pub fn next_sequence(&self) -> u8 {
        self.next_sequence
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    pub fn outstanding(&self) -> usize {
        self.unacked.len()
    }

    pub fn has_outstanding(&self) -> bool {
        !self.unacked.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.unacked.len() >= self.max_outstanding
    }

    /// Whether the frame about to be sent takes the last sequence number
    /// before V(S) wraps
    pub fn at_wrap(&self) -> bool {
        self.next_sequence == self.modulus - 1
    }

    /// Record a new I-frame and advance V(S); returns its N(S)
    pub fn push(&mut self, segment: Segment) -> u8 {
        debug_assert!(!self.is_full());
        let ns = self.next_sequence;
        self.unacked.push_back(PendingFrame { ns, segment });
        self.next_sequence = (self.next_sequence + 1) % self.modulus;
        ns
    }

    /// Release every frame acknowledged by the peer's N(R)
    ///
    /// Returns how many frames were released; an N(R) outside the
    /// outstanding range releases nothing.
    pub fn acknowledge(&mut self, nr: u8) -> usize {
        let Some(oldest) = self.unacked.front().map(|f| f.ns) else {
            return 0;
        };
        let count = ((nr + self.modulus - oldest) % self.modulus) as usize;
        if count > self.unacked.len() {
            return 0;
        }
        self.unacked.drain(..count);
        count
    }

    /// Frames to go out again, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &PendingFrame> {
        self.unacked.iter()
    }
}

/// Receive window: V(R)
#[derive(Debug)]
pub struct ReceiveWindow {
    modulus: u8,
    expected_sequence: u8,
}

impl ReceiveWindow {
    pub fn new(modulus: u8) -> Self {
        Self {
            modulus,
            expected_sequence: 0,
        }
    }

    /// V(R)
    pub fn expected_sequence(&self) -> u8 {
        self.expected_sequence
    }

    /// Accept N(S) if it is the next in sequence, advancing V(R)
    pub fn accept(&mut self, ns: u8) -> bool {
        if ns != self.expected_sequence {
            return false;
        }
        self.expected_sequence = (self.expected_sequence + 1) % self.modulus;
        true
    }
}
