//! COSEM data values

use crate::datatypes::date_time::{CosemDate, CosemDateTime, CosemTime};
use crate::error::{DlmsError, DlmsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A-XDR tag of every COSEM data choice
pub mod tag {
    pub const NULL_DATA: u8 = 0x00;
    pub const ARRAY: u8 = 0x01;
    pub const STRUCTURE: u8 = 0x02;
    pub const BOOLEAN: u8 = 0x03;
    pub const BIT_STRING: u8 = 0x04;
    pub const DOUBLE_LONG: u8 = 0x05;
    pub const DOUBLE_LONG_UNSIGNED: u8 = 0x06;
    pub const FLOATING_POINT: u8 = 0x07;
    pub const OCTET_STRING: u8 = 0x09;
    pub const VISIBLE_STRING: u8 = 0x0A;
    pub const UTF8_STRING: u8 = 0x0C;
    pub const BCD: u8 = 0x0D;
    pub const INTEGER: u8 = 0x0F;
    pub const LONG: u8 = 0x10;
    pub const UNSIGNED: u8 = 0x11;
    pub const LONG_UNSIGNED: u8 = 0x12;
    pub const LONG64: u8 = 0x14;
    pub const LONG64_UNSIGNED: u8 = 0x15;
    pub const ENUM: u8 = 0x16;
    pub const FLOAT32: u8 = 0x17;
    pub const FLOAT64: u8 = 0x18;
    pub const DATE_TIME: u8 = 0x19;
    pub const DATE: u8 = 0x1A;
    pub const TIME: u8 = 0x1B;
    pub const DONT_CARE: u8 = 0xFF;
}

/// Bit string value: `len` significant bits packed MSB first into `bytes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitString {
    pub bytes: Vec<u8>,
    pub len: usize,
}

impl BitString {
    /// Build a bit string from whole bytes, dropping `unused_bits` at the end
    pub fn new(bytes: Vec<u8>, unused_bits: usize) -> DlmsResult<Self> {
        if unused_bits > 7 || (bytes.is_empty() && unused_bits > 0) {
            return Err(DlmsError::InvalidValue(format!(
                "bit string cannot have {} unused bits",
                unused_bits
            )));
        }
        let len = bytes.len() * 8 - unused_bits;
        Ok(Self { bytes, len })
    }

    pub fn unused_bits(&self) -> usize {
        self.bytes.len() * 8 - self.len
    }
}

/// Tagged COSEM data value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataObject {
    Null,
    Array(Vec<DataObject>),
    Structure(Vec<DataObject>),
    Boolean(bool),
    BitString(BitString),
    DoubleLong(i32),
    DoubleLongUnsigned(u32),
    OctetString(Vec<u8>),
    VisibleString(Vec<u8>),
    Utf8String(Vec<u8>),
    Bcd(i8),
    Integer(i8),
    Long(i16),
    Unsigned(u8),
    LongUnsigned(u16),
    Long64(i64),
    Long64Unsigned(u64),
    Enum(u8),
    Float32(f32),
    Float64(f64),
    DateTime(CosemDateTime),
    Date(CosemDate),
    Time(CosemTime),
    DontCare,
}

impl DataObject {
    /// A-XDR tag byte of this value
    pub fn tag(&self) -> u8 {
        match self {
            DataObject::Null => tag::NULL_DATA,
            DataObject::Array(_) => tag::ARRAY,
            DataObject::Structure(_) => tag::STRUCTURE,
            DataObject::Boolean(_) => tag::BOOLEAN,
            DataObject::BitString(_) => tag::BIT_STRING,
            DataObject::DoubleLong(_) => tag::DOUBLE_LONG,
            DataObject::DoubleLongUnsigned(_) => tag::DOUBLE_LONG_UNSIGNED,
            DataObject::OctetString(_) => tag::OCTET_STRING,
            DataObject::VisibleString(_) => tag::VISIBLE_STRING,
            DataObject::Utf8String(_) => tag::UTF8_STRING,
            DataObject::Bcd(_) => tag::BCD,
            DataObject::Integer(_) => tag::INTEGER,
            DataObject::Long(_) => tag::LONG,
            DataObject::Unsigned(_) => tag::UNSIGNED,
            DataObject::LongUnsigned(_) => tag::LONG_UNSIGNED,
            DataObject::Long64(_) => tag::LONG64,
            DataObject::Long64Unsigned(_) => tag::LONG64_UNSIGNED,
            DataObject::Enum(_) => tag::ENUM,
            DataObject::Float32(_) => tag::FLOAT32,
            DataObject::Float64(_) => tag::FLOAT64,
            DataObject::DateTime(_) => tag::DATE_TIME,
            DataObject::Date(_) => tag::DATE,
            DataObject::Time(_) => tag::TIME,
            DataObject::DontCare => tag::DONT_CARE,
        }
    }

    /// Constructs a visible string from text
    pub fn visible_string(s: &str) -> Self {
        DataObject::VisibleString(s.as_bytes().to_vec())
    }

    /// Constructs an array, requiring all elements to share one tag
    pub fn new_array(items: Vec<DataObject>) -> DlmsResult<Self> {
        if let Some(first) = items.first() {
            let t = first.tag();
            if let Some(pos) = items.iter().position(|i| i.tag() != t) {
                return Err(DlmsError::InvalidValue(format!(
                    "array element {} has tag 0x{:02X}, expected 0x{:02X}",
                    pos,
                    items[pos].tag(),
                    t
                )));
            }
        }
        Ok(DataObject::Array(items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataObject::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataObject::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DataObject::OctetString(b) | DataObject::VisibleString(b) | DataObject::Utf8String(b) => {
                Some(b)
            }
            _ => None,
        }
    }

    /// Any integer choice widened to `i64`; `None` for non-integers and
    /// unsigned 64-bit values that do not fit
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            DataObject::DoubleLong(v) => Some(v as i64),
            DataObject::DoubleLongUnsigned(v) => Some(v as i64),
            DataObject::Bcd(v) | DataObject::Integer(v) => Some(v as i64),
            DataObject::Long(v) => Some(v as i64),
            DataObject::Unsigned(v) | DataObject::Enum(v) => Some(v as i64),
            DataObject::LongUnsigned(v) => Some(v as i64),
            DataObject::Long64(v) => Some(v),
            DataObject::Long64Unsigned(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_date_time(&self) -> Option<&CosemDateTime> {
        match self {
            DataObject::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_elements(&self) -> Option<&[DataObject]> {
        match self {
            DataObject::Array(v) | DataObject::Structure(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataObject::Null => write!(f, "null"),
            DataObject::DontCare => write!(f, "dont-care"),
            DataObject::Boolean(b) => write!(f, "{}", b),
            DataObject::OctetString(s) => {
                for (i, byte) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{:02X}", byte)?;
                }
                Ok(())
            }
            DataObject::VisibleString(s) | DataObject::Utf8String(s) => {
                write!(f, "\"{}\"", String::from_utf8_lossy(s))
            }
            DataObject::BitString(bs) => write!(f, "bits[{}]", bs.len),
            DataObject::Float32(v) => write!(f, "{}", v),
            DataObject::Float64(v) => write!(f, "{}", v),
            DataObject::DateTime(dt) => write!(f, "{}", dt),
            DataObject::Date(d) => write!(f, "{:04}-{:02}-{:02}", d.year, d.month, d.day_of_month),
            DataObject::Time(t) => write!(f, "{:02}:{:02}:{:02}", t.hour, t.minute, t.second),
            DataObject::Array(items) | DataObject::Structure(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            other => match other.as_i64() {
                Some(v) => write!(f, "{}", v),
                None => write!(f, "{:?}", other),
            },
        }
    }
}

/// Data access result codes carried in GET/SET responses
pub mod data_access_result {
    pub const SUCCESS: u8 = 0;
    pub const HARDWARE_FAULT: u8 = 1;
    pub const TEMPORARY_FAILURE: u8 = 2;
    pub const READ_WRITE_DENIED: u8 = 3;
    pub const OBJECT_UNDEFINED: u8 = 4;
    pub const OBJECT_CLASS_INCONSISTENT: u8 = 9;
    pub const OBJECT_UNAVAILABLE: u8 = 11;
    pub const TYPE_UNMATCHED: u8 = 12;
    pub const SCOPE_OF_ACCESS_VIOLATED: u8 = 13;
    pub const DATA_BLOCK_UNAVAILABLE: u8 = 14;
    pub const LONG_GET_ABORTED: u8 = 15;
    pub const NO_LONG_GET_IN_PROGRESS: u8 = 16;
    pub const LONG_SET_ABORTED: u8 = 17;
    pub const NO_LONG_SET_IN_PROGRESS: u8 = 18;
    pub const DATA_BLOCK_NUMBER_INVALID: u8 = 19;
    pub const OTHER_REASON: u8 = 250;
}

/// Action result codes carried in ACTION responses
pub mod action_result {
    pub const SUCCESS: u8 = 0;
    pub const HARDWARE_FAULT: u8 = 1;
    pub const TEMPORARY_FAILURE: u8 = 2;
    pub const READ_WRITE_DENIED: u8 = 3;
    pub const OBJECT_UNDEFINED: u8 = 4;
    pub const TYPE_UNMATCHED: u8 = 12;
    pub const OTHER_REASON: u8 = 250;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(DataObject::Null.tag(), 0x00);
        assert_eq!(DataObject::OctetString(vec![]).tag(), 0x09);
        assert_eq!(DataObject::DoubleLongUnsigned(1).tag(), 0x06);
        assert_eq!(DataObject::DontCare.tag(), 0xFF);
    }

    #[test]
    fn test_array_requires_uniform_tags() {
        let ok = DataObject::new_array(vec![DataObject::Unsigned(1), DataObject::Unsigned(2)]);
        assert!(ok.is_ok());
        let mixed = DataObject::new_array(vec![DataObject::Unsigned(1), DataObject::Boolean(true)]);
        assert!(mixed.is_err());
    }

    #[test]
    fn test_bit_string_unused_bits() {
        let bs = BitString::new(vec![0xF0, 0x80], 7).unwrap();
        assert_eq!(bs.len, 9);
        assert_eq!(bs.unused_bits(), 7);
        assert!(BitString::new(vec![], 1).is_err());
    }

    #[test]
    fn test_display() {
        let v = DataObject::OctetString(vec![0x11, 0x22]);
        assert_eq!(v.to_string(), "11 22");
        let s = DataObject::Structure(vec![DataObject::LongUnsigned(7), DataObject::visible_string("ab")]);
        assert_eq!(s.to_string(), "[7, \"ab\"]");
    }
}
