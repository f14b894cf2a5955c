//! HDLC statistics collection

use std::sync::atomic::{AtomicU64, Ordering};

/// HDLC link statistics
///
/// Shared between the link event loop, its frame reader and the handle; every
/// counter is updated atomically.
#[derive(Debug, Default)]
pub struct HdlcStatistics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    fcs_errors: AtomicU64,
    hcs_errors: AtomicU64,
    control_errors: AtomicU64,
    address_errors: AtomicU64,
    sequence_errors: AtomicU64,
    retransmissions: AtomicU64,
    timeouts: AtomicU64,
    repolls: AtomicU64,
}

/// Point-in-time copy of [`HdlcStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdlcStatisticsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub fcs_errors: u64,
    pub hcs_errors: u64,
    pub control_errors: u64,
    pub address_errors: u64,
    pub sequence_errors: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub repolls: u64,
}

impl HdlcStatisticsSnapshot {
    /// Frames dropped as malformed or misaddressed
    pub fn frames_dropped(&self) -> u64 {
        self.fcs_errors + self.hcs_errors + self.control_errors + self.address_errors
    }
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl HdlcStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_frames_sent(&self) {
        bump(&self.frames_sent);
    }

    pub fn increment_frames_received(&self) {
        bump(&self.frames_received);
    }

    pub fn increment_fcs_errors(&self) {
        bump(&self.fcs_errors);
    }

    pub fn increment_hcs_errors(&self) {
        bump(&self.hcs_errors);
    }

    pub fn increment_control_errors(&self) {
        bump(&self.control_errors);
    }

    pub fn increment_address_errors(&self) {
        bump(&self.address_errors);
    }

    pub fn increment_sequence_errors(&self) {
        bump(&self.sequence_errors);
    }

    pub fn increment_retransmissions(&self) {
        bump(&self.retransmissions);
    }

    pub fn increment_timeouts(&self) {
        bump(&self.timeouts);
    }

    pub fn increment_repolls(&self) {
        bump(&self.repolls);
    }

    pub fn snapshot(&self) -> HdlcStatisticsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HdlcStatisticsSnapshot {
            frames_sent: get(&self.frames_sent),
            frames_received: get(&self.frames_received),
            fcs_errors: get(&self.fcs_errors),
            hcs_errors: get(&self.hcs_errors),
            control_errors: get(&self.control_errors),
            address_errors: get(&self.address_errors),
            sequence_errors: get(&self.sequence_errors),
            retransmissions: get(&self.retransmissions),
            timeouts: get(&self.timeouts),
            repolls: get(&self.repolls),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = HdlcStatistics::new();
        stats.increment_frames_sent();
        stats.increment_fcs_errors();
        stats.increment_address_errors();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_dropped(), 2);
    }
}
