//! A-XDR decoder for DLMS/COSEM

use dlms_core::datatypes::{tag, BitString, CosemDate, CosemDateTime, CosemTime, DataObject};
use crate::error::{DlmsError, DlmsResult};

/// Nesting limit for arrays and structures received from a peer
pub const MAX_DEPTH: usize = 32;

/// A-XDR decoder over a borrowed buffer
///
/// Tracks a read position; every read fails with [`DlmsError::Decode`] when the
/// buffer is exhausted instead of panicking.
pub struct AxdrDecoder<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> AxdrDecoder<'a> {
    /// Create a new decoder
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything not consumed yet
    pub fn rest(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    pub fn read_u8(&mut self) -> DlmsResult<u8> {
        let b = self.read_bytes(1)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self) -> DlmsResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> DlmsResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> DlmsResult<u64> {
        let b = self.read_bytes(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    pub fn read_bool(&mut self) -> DlmsResult<bool> {
        Ok(self.read_u8()? != 0x00)
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> DlmsResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(DlmsError::Decode(format!(
                "short buffer: need {} bytes at offset {}, have {}",
                len,
                self.position,
                self.remaining()
            )));
        }
        let out = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(out)
    }

    /// Read an A-XDR length (short form or `0x8N` + N bytes)
    pub fn read_length(&mut self) -> DlmsResult<usize> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 {
            return Err(DlmsError::Decode(format!("unsupported length form 0x{:02X}", first)));
        }
        let mut len = 0usize;
        for &b in self.read_bytes(n)? {
            len = (len << 8) | b as usize;
        }
        Ok(len)
    }

    /// Length-prefixed octet string (no tag)
    pub fn read_octet_string(&mut self) -> DlmsResult<&'a [u8]> {
        let len = self.read_length()?;
        self.read_bytes(len)
    }

    /// Optional value: `0x00` absent, `0x01` present
    pub fn read_optional_data(&mut self) -> DlmsResult<Option<DataObject>> {
        match self.read_u8()? {
            0x00 => Ok(None),
            0x01 => Ok(Some(self.decode_data_object()?)),
            other => Err(DlmsError::Decode(format!("bad optional flag 0x{:02X}", other))),
        }
    }

    /// Decode a tagged COSEM data value
    pub fn decode_data_object(&mut self) -> DlmsResult<DataObject> {
        self.decode_at_depth(0)
    }

    fn decode_at_depth(&mut self, depth: usize) -> DlmsResult<DataObject> {
        let t = self.read_u8()?;
        let value = match t {
            tag::NULL_DATA => DataObject::Null,
            tag::DONT_CARE => DataObject::DontCare,
            tag::ARRAY | tag::STRUCTURE => {
                if depth >= MAX_DEPTH {
                    return Err(DlmsError::Decode("data nested too deeply".to_string()));
                }
                let count = self.read_length()?;
                // every element takes at least one byte
                if count > self.remaining() {
                    return Err(DlmsError::Decode(format!("element count {} exceeds buffer", count)));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.decode_at_depth(depth + 1)?);
                }
                if t == tag::ARRAY {
                    DataObject::Array(items)
                } else {
                    DataObject::Structure(items)
                }
            }
            tag::BOOLEAN => DataObject::Boolean(self.read_bool()?),
            tag::BIT_STRING => {
                let bits = self.read_length()?;
                let bytes = self.read_bytes(bits.div_ceil(8))?.to_vec();
                DataObject::BitString(BitString { bytes, len: bits })
            }
            tag::DOUBLE_LONG => DataObject::DoubleLong(self.read_u32()? as i32),
            tag::DOUBLE_LONG_UNSIGNED => DataObject::DoubleLongUnsigned(self.read_u32()?),
            tag::FLOATING_POINT | tag::FLOAT32 => {
                DataObject::Float32(f32::from_bits(self.read_u32()?))
            }
            tag::OCTET_STRING => DataObject::OctetString(self.read_octet_string()?.to_vec()),
            tag::VISIBLE_STRING => DataObject::VisibleString(self.read_octet_string()?.to_vec()),
            tag::UTF8_STRING => DataObject::Utf8String(self.read_octet_string()?.to_vec()),
            tag::BCD => DataObject::Bcd(self.read_u8()? as i8),
            tag::INTEGER => DataObject::Integer(self.read_u8()? as i8),
            tag::LONG => DataObject::Long(self.read_u16()? as i16),
            tag::UNSIGNED => DataObject::Unsigned(self.read_u8()?),
            tag::LONG_UNSIGNED => DataObject::LongUnsigned(self.read_u16()?),
            tag::LONG64 => DataObject::Long64(self.read_u64()? as i64),
            tag::LONG64_UNSIGNED => DataObject::Long64Unsigned(self.read_u64()?),
            tag::ENUM => DataObject::Enum(self.read_u8()?),
            tag::FLOAT64 => DataObject::Float64(f64::from_bits(self.read_u64()?)),
            tag::DATE_TIME => DataObject::DateTime(CosemDateTime::decode(
                self.read_bytes(CosemDateTime::LENGTH)?,
            )?),
            tag::DATE => DataObject::Date(CosemDate::decode(self.read_bytes(CosemDate::LENGTH)?)?),
            tag::TIME => DataObject::Time(CosemTime::decode(self.read_bytes(CosemTime::LENGTH)?)?),
            other => {
                return Err(DlmsError::Decode(format!(
                    "unknown data tag 0x{:02X} at offset {}",
                    other,
                    self.position - 1
                )));
            }
        };
        Ok(value)
    }
}

/// Decode a single data value, returning it with the number of bytes consumed
pub fn decode_data(bytes: &[u8]) -> DlmsResult<(DataObject, usize)> {
    let mut dec = AxdrDecoder::new(bytes);
    let value = dec.decode_data_object()?;
    Ok((value, dec.position()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axdr::encoder::encode_data;

    #[test]
    fn test_decode_octet_string() {
        let (v, n) = decode_data(&[0x09, 0x06, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0xAA]).unwrap();
        assert_eq!(v, DataObject::OctetString(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        assert_eq!(n, 8);
    }

    #[test]
    fn test_decode_nested_value() {
        let value = DataObject::Structure(vec![
            DataObject::DoubleLong(-5),
            DataObject::Array(vec![DataObject::Unsigned(1), DataObject::Unsigned(2)]),
            DataObject::visible_string("meter"),
            DataObject::Float64(1.5),
        ]);
        let bytes = encode_data(&value).unwrap();
        let (decoded, n) = decode_data(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(n, bytes.len());
    }

    #[test]
    fn test_decode_floating_point_choice() {
        let (v, _) = decode_data(&[0x07, 0x3F, 0x80, 0x00, 0x00]).unwrap();
        assert_eq!(v, DataObject::Float32(1.0));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode_data(&[0x09, 0x06, 0x11]).is_err());
        assert!(decode_data(&[0x06, 0x00]).is_err());
        assert!(decode_data(&[0x02, 0x7F]).is_err());
    }

    #[test]
    fn test_decode_unknown_tag() {
        match decode_data(&[0x42]) {
            Err(DlmsError::Decode(msg)) => assert!(msg.contains("0x42")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_read_long_length() {
        let mut dec = AxdrDecoder::new(&[0x82, 0x01, 0x00]);
        assert_eq!(dec.read_length().unwrap(), 256);
        assert!(dec.is_empty());
    }
}
