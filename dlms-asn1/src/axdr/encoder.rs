//! A-XDR encoder for DLMS/COSEM

use dlms_core::datatypes::DataObject;
use crate::error::{DlmsError, DlmsResult};

/// A-XDR encoder writing into an owned buffer
///
/// Besides the tagged [`DataObject`] encoding, the primitive writers are used
/// by the APDU encoders for their untagged fields.
#[derive(Debug, Default)]
pub struct AxdrEncoder {
    buffer: Vec<u8>,
}

impl AxdrEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn encode_u8(&mut self, v: u8) {
        self.buffer.push(v);
    }

    pub fn encode_u16(&mut self, v: u16) {
        self.buffer.extend_from_slice(&v.to_be_bytes());
    }

    pub fn encode_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_be_bytes());
    }

    pub fn encode_bool(&mut self, v: bool) {
        self.buffer.push(if v { 0x01 } else { 0x00 });
    }

    /// Append raw bytes without a length prefix
    pub fn encode_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Encode an A-XDR length: short form below 0x80, otherwise `0x8N` followed
    /// by N big-endian length bytes
    pub fn encode_length(&mut self, len: usize) {
        if len < 0x80 {
            self.buffer.push(len as u8);
        } else if len <= 0xFF {
            self.buffer.extend_from_slice(&[0x81, len as u8]);
        } else if len <= 0xFFFF {
            self.buffer.push(0x82);
            self.buffer.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buffer.push(0x84);
            self.buffer.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }

    /// Length-prefixed octet string (no tag)
    pub fn encode_octet_string(&mut self, bytes: &[u8]) {
        self.encode_length(bytes.len());
        self.buffer.extend_from_slice(bytes);
    }

    /// Encode a tagged COSEM data value
    pub fn encode_data_object(&mut self, obj: &DataObject) -> DlmsResult<()> {
        self.buffer.push(obj.tag());
        match obj {
            DataObject::Null | DataObject::DontCare => {}
            DataObject::Array(items) | DataObject::Structure(items) => {
                self.encode_length(items.len());
                for item in items {
                    self.encode_data_object(item)?;
                }
            }
            DataObject::Boolean(b) => self.encode_bool(*b),
            DataObject::BitString(bs) => {
                if bs.len > bs.bytes.len() * 8 {
                    return Err(DlmsError::InvalidValue(format!(
                        "bit string of {} bits carried in {} bytes",
                        bs.len,
                        bs.bytes.len()
                    )));
                }
                self.encode_length(bs.len);
                self.buffer.extend_from_slice(&bs.bytes[..bs.len.div_ceil(8)]);
            }
            DataObject::DoubleLong(v) => self.buffer.extend_from_slice(&v.to_be_bytes()),
            DataObject::DoubleLongUnsigned(v) => self.encode_u32(*v),
            DataObject::OctetString(b) | DataObject::VisibleString(b) | DataObject::Utf8String(b) => {
                self.encode_octet_string(b)
            }
            DataObject::Bcd(v) | DataObject::Integer(v) => self.buffer.push(*v as u8),
            DataObject::Long(v) => self.buffer.extend_from_slice(&v.to_be_bytes()),
            DataObject::Unsigned(v) | DataObject::Enum(v) => self.buffer.push(*v),
            DataObject::LongUnsigned(v) => self.encode_u16(*v),
            DataObject::Long64(v) => self.buffer.extend_from_slice(&v.to_be_bytes()),
            DataObject::Long64Unsigned(v) => self.buffer.extend_from_slice(&v.to_be_bytes()),
            DataObject::Float32(v) => self.buffer.extend_from_slice(&v.to_be_bytes()),
            DataObject::Float64(v) => self.buffer.extend_from_slice(&v.to_be_bytes()),
            DataObject::DateTime(dt) => self.buffer.extend_from_slice(&dt.encode()),
            DataObject::Date(d) => self.buffer.extend_from_slice(&d.encode()),
            DataObject::Time(t) => self.buffer.extend_from_slice(&t.encode()),
        }
        Ok(())
    }

    /// Optional value: `0x00` when absent, `0x01` followed by the value otherwise
    pub fn encode_optional_data(&mut self, obj: Option<&DataObject>) -> DlmsResult<()> {
        match obj {
            None => self.encode_u8(0x00),
            Some(o) => {
                self.encode_u8(0x01);
                self.encode_data_object(o)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Encode a single data value to a fresh buffer
pub fn encode_data(obj: &DataObject) -> DlmsResult<Vec<u8>> {
    let mut enc = AxdrEncoder::new();
    enc.encode_data_object(obj)?;
    Ok(enc.into_bytes())
}
