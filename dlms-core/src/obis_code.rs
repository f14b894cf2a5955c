use crate::error::{DlmsError, DlmsResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `A-B:C.D.E*F`, with the `*F` group optional (defaults to 255)
static EXTENDED_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3})-(\d{1,3}):(\d{1,3})\.(\d{1,3})\.(\d{1,3})(?:\*(\d{1,3}))?$")
        .expect("static OBIS pattern")
});

/// OBIS code identifying a COSEM object instance
///
/// The six bytes are carried verbatim as the instance id of GET/SET/ACTION
/// descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObisCode {
    bytes: [u8; 6],
}

impl ObisCode {
    /// Create a new OBIS code from its A..F groups
    ///
    /// # Arguments
    ///
    /// * `a` - Media (A value)
    /// * `b` - Channel (B value)
    /// * `c` - Physical quantity (C value)
    /// * `d` - Processing (D value)
    /// * `e` - Tariff or further classification (E value)
    /// * `f` - Billing period (F value)
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self {
            bytes: [a, b, c, d, e, f],
        }
    }

    /// Parse an OBIS code from text
    ///
    /// Accepted forms:
    /// - `"1.0.1.8.0.255"`
    /// - `"1-0:1.8.0*255"` and `"1-0:1.8.0"` (F defaults to 255)
    ///
    /// # Arguments
    ///
    /// * `s` - Text form of the code, surrounding whitespace ignored
    ///
    /// # Returns
    ///
    /// The code, or `DlmsError::InvalidData` when no form matches
    ///
    /// # Examples
    ///
    /// ```
    /// use dlms_core::ObisCode;
    ///
    /// let energy = ObisCode::from_string("1-0:1.8.0").unwrap();
    /// assert_eq!(energy, ObisCode::new(1, 0, 1, 8, 0, 255));
    /// assert!(ObisCode::from_string("1.0.1.8").is_err());
    /// ```
    pub fn from_string(s: &str) -> DlmsResult<Self> {
        let s = s.trim();
        if let Ok(code) = Self::parse_dot_format(s) {
            return Ok(code);
        }
        if let Ok(code) = Self::parse_extended_format(s) {
            return Ok(code);
        }
        Err(DlmsError::InvalidData(format!("Invalid OBIS code format: {}", s)))
    }

    fn parse_dot_format(s: &str) -> DlmsResult<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 6 {
            return Err(DlmsError::InvalidData("Expected 6 dot-separated values".to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = parse_group(part)?;
        }
        Ok(Self { bytes })
    }

    fn parse_extended_format(s: &str) -> DlmsResult<Self> {
        let caps = EXTENDED_FORMAT
            .captures(s)
            .ok_or_else(|| DlmsError::InvalidData(format!("Not an A-B:C.D.E*F code: {}", s)))?;

        let mut bytes = [0xFFu8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            if let Some(m) = caps.get(i + 1) {
                *byte = parse_group(m.as_str())?;
            }
        }
        Ok(Self { bytes })
    }

    /// Get the OBIS code as a byte array
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.bytes
    }

    /// Get the OBIS code as a copied byte array
    pub fn to_bytes(&self) -> [u8; 6] {
        self.bytes
    }

    pub fn a(&self) -> u8 {
        self.bytes[0]
    }

    pub fn b(&self) -> u8 {
        self.bytes[1]
    }

    pub fn c(&self) -> u8 {
        self.bytes[2]
    }

    pub fn d(&self) -> u8 {
        self.bytes[3]
    }

    pub fn e(&self) -> u8 {
        self.bytes[4]
    }

    pub fn f(&self) -> u8 {
        self.bytes[5]
    }
}

fn parse_group(s: &str) -> DlmsResult<u8> {
    s.parse::<u8>()
        .map_err(|_| DlmsError::InvalidData(format!("Invalid OBIS group value: {}", s)))
}

impl From<[u8; 6]> for ObisCode {
    fn from(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }
}

impl FromStr for ObisCode {
    type Err = DlmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4], self.bytes[5]
        )
    }
}
