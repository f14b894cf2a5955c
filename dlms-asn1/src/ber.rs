//! Minimal BER TLV helpers for the ACSE association PDUs
//!
//! Only single-byte tags and definite lengths are handled; that covers every
//! element of AARQ and AARE as exchanged with meters.

use crate::error::{DlmsError, DlmsResult};

pub const CLASS_APPLICATION: u8 = 0x40;
pub const CLASS_CONTEXT: u8 = 0x80;
pub const CONSTRUCTED: u8 = 0x20;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_OBJECT_IDENTIFIER: u8 = 0x06;

/// BER encoder writing TLV triplets into an owned buffer
#[derive(Debug, Default)]
pub struct BerEncoder {
    buffer: Vec<u8>,
}

impl BerEncoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Encode a tag, definite length and value
    pub fn encode_tlv(&mut self, tag: u8, value: &[u8]) {
        self.buffer.push(tag);
        self.encode_length(value.len());
        self.buffer.extend_from_slice(value);
    }

    fn encode_length(&mut self, len: usize) {
        if len < 0x80 {
            self.buffer.push(len as u8);
        } else if len <= 0xFF {
            self.buffer.extend_from_slice(&[0x81, len as u8]);
        } else {
            self.buffer.push(0x82);
            self.buffer.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }

    /// Context-specific element `[number]`
    pub fn encode_context_specific(&mut self, number: u8, value: &[u8], constructed: bool) {
        let mut tag = CLASS_CONTEXT | number;
        if constructed {
            tag |= CONSTRUCTED;
        }
        self.encode_tlv(tag, value);
    }

    /// Application element `[APPLICATION number]`, always constructed
    pub fn encode_application(&mut self, number: u8, value: &[u8]) {
        self.encode_tlv(CLASS_APPLICATION | CONSTRUCTED | number, value);
    }

    pub fn encode_object_identifier(&mut self, arcs: &[u32]) -> DlmsResult<()> {
        let content = encode_oid_content(arcs)?;
        self.encode_tlv(TAG_OBJECT_IDENTIFIER, &content);
        Ok(())
    }

    pub fn encode_octet_string(&mut self, value: &[u8]) {
        self.encode_tlv(TAG_OCTET_STRING, value);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Content octets of an OBJECT IDENTIFIER (no tag, no length)
pub fn encode_oid_content(arcs: &[u32]) -> DlmsResult<Vec<u8>> {
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        return Err(DlmsError::InvalidValue(format!("bad object identifier {:?}", arcs)));
    }
    let mut out = Vec::new();
    push_base128(&mut out, arcs[0] * 40 + arcs[1]);
    for &arc in &arcs[2..] {
        push_base128(&mut out, arc);
    }
    Ok(out)
}

fn push_base128(out: &mut Vec<u8>, mut v: u32) {
    let mut tmp = [0u8; 5];
    let mut n = 0;
    loop {
        tmp[n] = (v & 0x7F) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        out.push(if i == 0 { tmp[i] } else { tmp[i] | 0x80 });
    }
}

/// BER decoder reading TLV triplets from a borrowed buffer
pub struct BerDecoder<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BerDecoder<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.buffer.len()
    }

    fn read_byte(&mut self) -> DlmsResult<u8> {
        let b = *self
            .buffer
            .get(self.position)
            .ok_or_else(|| DlmsError::Decode("BER buffer exhausted".to_string()))?;
        self.position += 1;
        Ok(b)
    }

    fn read_length(&mut self) -> DlmsResult<usize> {
        let first = self.read_byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 2 {
            return Err(DlmsError::Decode(format!("unsupported BER length 0x{:02X}", first)));
        }
        let mut len = 0usize;
        for _ in 0..n {
            len = (len << 8) | self.read_byte()? as usize;
        }
        Ok(len)
    }

    /// Read one TLV, returning its tag and value
    pub fn decode_tlv(&mut self) -> DlmsResult<(u8, &'a [u8])> {
        let tag = self.read_byte()?;
        if tag & 0x1F == 0x1F {
            return Err(DlmsError::Decode(format!("multi-byte BER tag 0x{:02X}", tag)));
        }
        let len = self.read_length()?;
        let end = self.position + len;
        if end > self.buffer.len() {
            return Err(DlmsError::Decode(format!(
                "BER element 0x{:02X} of {} bytes overruns buffer",
                tag, len
            )));
        }
        let value = &self.buffer[self.position..end];
        self.position = end;
        Ok((tag, value))
    }

    /// Read a TLV that must carry `expected` as its tag
    pub fn decode_expected(&mut self, expected: u8) -> DlmsResult<&'a [u8]> {
        let (tag, value) = self.decode_tlv()?;
        if tag != expected {
            return Err(DlmsError::Decode(format!(
                "expected BER tag 0x{:02X}, got 0x{:02X}",
                expected, tag
            )));
        }
        Ok(value)
    }

    pub fn decode_integer(&mut self) -> DlmsResult<i64> {
        let value = self.decode_expected(TAG_INTEGER)?;
        if value.is_empty() || value.len() > 8 {
            return Err(DlmsError::Decode(format!("BER integer of {} bytes", value.len())));
        }
        let mut v: i64 = if value[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in value {
            v = (v << 8) | b as i64;
        }
        Ok(v)
    }
}
