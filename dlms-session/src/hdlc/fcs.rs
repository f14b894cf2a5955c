//! Frame Check Sequence (FCS) calculation for HDLC
//!
//! PPP FCS-16 (RFC 1662). The same accumulator serves the header check
//! sequence and the frame check sequence.

use crate::error::{DlmsError, DlmsResult};

/// FCS calculation constants
pub const INITIAL_FCS: u16 = 0xFFFF;
pub const GOOD_FCS: u16 = 0xF0B8;
const KEY: u16 = 0x8408; // Bit-reversed 1021

/// Precomputed FCS table
static FCS_TABLE: once_cell::sync::Lazy<[u16; 256]> = once_cell::sync::Lazy::new(|| {
    let mut table = [0u16; 256];
    for (b, slot) in table.iter_mut().enumerate() {
        let mut v = b as u16;
        for _ in 0..8 {
            if (v & 1) == 1 {
                v = (v >> 1) ^ KEY;
            } else {
                v >>= 1;
            }
        }
        *slot = v;
    }
    table
});

/// Feed `bytes` into an FCS accumulator
pub fn fcs16(mut accum: u16, bytes: &[u8]) -> u16 {
    for &b in bytes {
        accum = (accum >> 8) ^ FCS_TABLE[((accum ^ b as u16) & 0xFF) as usize];
    }
    accum
}

/// Frame Check Sequence calculator
#[derive(Debug, Clone, Copy)]
pub struct FcsCalc {
    fcs_value: u16,
}

impl FcsCalc {
    /// Create a new FCS calculator
    pub fn new() -> Self {
        Self {
            fcs_value: INITIAL_FCS,
        }
    }

    /// Update the FCS value with a single byte
    pub fn update(&mut self, data: u8) {
        self.fcs_value = fcs16(self.fcs_value, &[data]);
    }

    /// Update the FCS value with multiple bytes
    pub fn update_bytes(&mut self, data: &[u8]) {
        self.fcs_value = fcs16(self.fcs_value, data);
    }

    /// Check sequence to append: complemented accumulator, least significant byte first
    pub fn fcs_value_bytes(&self) -> [u8; 2] {
        (!self.fcs_value).to_le_bytes()
    }

    /// Validate the accumulator after the check sequence bytes were fed in
    pub fn validate(&self, what: &str) -> DlmsResult<()> {
        if self.fcs_value != GOOD_FCS {
            Err(DlmsError::MalformedSegment(format!(
                "{} has wrong value: 0x{:04X}, expected 0x{:04X}",
                what, self.fcs_value, GOOD_FCS
            )))
        } else {
            Ok(())
        }
    }

    /// Get the current FCS value
    pub fn value(&self) -> u16 {
        self.fcs_value
    }
}

impl Default for FcsCalc {
    fn default() -> Self {
        Self::new()
    }
}
