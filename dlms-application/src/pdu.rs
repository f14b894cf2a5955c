//! Building blocks shared by the GET/SET/ACTION PDU codecs
//!
//! Every xDLMS data PDU starts with the same three bytes: the service tag
//! (`0xC0` GET request, `0xC4` GET response, ...), the request/response
//! choice, and the invoke-id-and-priority byte.

use crate::error::{DlmsError, DlmsResult};
use dlms_asn1::{AxdrDecoder, AxdrEncoder};
use dlms_core::{DataObject, ObisCode};

/// Service tags of the xDLMS data PDUs
pub mod tag {
    pub const GET_REQUEST: u8 = 0xC0;
    pub const SET_REQUEST: u8 = 0xC1;
    pub const ACTION_REQUEST: u8 = 0xC3;
    pub const GET_RESPONSE: u8 = 0xC4;
    pub const SET_RESPONSE: u8 = 0xC5;
    pub const ACTION_RESPONSE: u8 = 0xC7;
}

/// Highest invoke id that fits the 4 bit field
pub const MAX_INVOKE_ID: u8 = 0x0F;

/// Invoke id and priority packed in one byte
///
/// The invoke id lives in the high nibble, bit 0 carries the priority:
/// `0x81` is invoke id 8 at high priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvokeIdAndPriority(u8);

impl InvokeIdAndPriority {
    pub fn new(invoke_id: u8, high_priority: bool) -> DlmsResult<Self> {
        if invoke_id > MAX_INVOKE_ID {
            return Err(DlmsError::InvalidValue(format!(
                "invoke id {} exceeds limit {}",
                invoke_id, MAX_INVOKE_ID
            )));
        }
        Ok(Self((invoke_id << 4) | u8::from(high_priority)))
    }

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn invoke_id(&self) -> u8 {
        (self.0 & 0xF0) >> 4
    }

    pub fn is_high_priority(&self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

/// Fixed three byte head of every data PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub tag: u8,
    pub choice: u8,
    pub invoke: InvokeIdAndPriority,
}

impl PduHeader {
    pub fn new(tag: u8, choice: u8, invoke: InvokeIdAndPriority) -> Self {
        Self { tag, choice, invoke }
    }

    pub fn encode(&self, enc: &mut AxdrEncoder) {
        enc.encode_raw(&[self.tag, self.choice, self.invoke.byte()]);
    }

    /// Peek the header of a received PDU
    pub fn peek(pdu: &[u8]) -> DlmsResult<Self> {
        match pdu {
            [tag, choice, invoke, ..] => Ok(Self::new(*tag, *choice, InvokeIdAndPriority::from_byte(*invoke))),
            _ => Err(DlmsError::Decode(format!("short pdu of {} bytes", pdu.len()))),
        }
    }

    /// Read the header and check that it carries `tag` / `choice`
    pub fn expect(dec: &mut AxdrDecoder<'_>, tag: u8, choice: u8) -> DlmsResult<Self> {
        let header = Self::peek(dec.rest())?;
        if header.tag != tag || header.choice != choice {
            return Err(DlmsError::Decode(format!(
                "pdu is {:02X} {:02X}, expected {:02X} {:02X}",
                header.tag, header.choice, tag, choice
            )));
        }
        dec.read_bytes(3)?;
        Ok(header)
    }
}

/// Class id, instance id and attribute (or method) id of a COSEM object item
///
/// # Structure
/// `class-id: u16`, `instance-id: 6 bytes`, `item-id: i8` as carried by the
/// Cosem-Attribute-Descriptor and the Cosem-Method-Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CosemItemDescriptor {
    pub class_id: u16,
    pub instance_id: ObisCode,
    pub item_id: u8,
}

impl CosemItemDescriptor {
    pub fn new(class_id: u16, instance_id: ObisCode, item_id: u8) -> Self {
        Self {
            class_id,
            instance_id,
            item_id,
        }
    }

    pub fn encode(&self, enc: &mut AxdrEncoder) {
        enc.encode_u16(self.class_id);
        enc.encode_raw(self.instance_id.as_bytes());
        enc.encode_u8(self.item_id);
    }

    pub fn decode(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Self> {
        let class_id = dec.read_u16()?;
        let mut instance = [0u8; 6];
        instance.copy_from_slice(dec.read_bytes(6)?);
        let item_id = dec.read_u8()?;
        Ok(Self::new(class_id, ObisCode::from(instance), item_id))
    }
}

/// Selective access: selector plus its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SelectiveAccess {
    pub selector: u8,
    pub parameters: DataObject,
}

/// Encode an optional access selection: `00` absent, `01 selector data` present
pub fn encode_access_selection(enc: &mut AxdrEncoder, access: Option<&SelectiveAccess>) -> DlmsResult<()> {
    match access {
        None => enc.encode_u8(0x00),
        Some(a) => {
            enc.encode_u8(0x01);
            enc.encode_u8(a.selector);
            enc.encode_data_object(&a.parameters)?;
        }
    }
    Ok(())
}

pub fn decode_access_selection(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Option<SelectiveAccess>> {
    match dec.read_u8()? {
        0x00 => Ok(None),
        0x01 => {
            let selector = dec.read_u8()?;
            let parameters = dec.decode_data_object()?;
            Ok(Some(SelectiveAccess { selector, parameters }))
        }
        other => Err(DlmsError::Decode(format!("bad access selection flag 0x{:02X}", other))),
    }
}

/// Count prefix of a SEQUENCE OF, checked against what is left in the buffer
pub fn read_count(dec: &mut AxdrDecoder<'_>) -> DlmsResult<usize> {
    let count = dec.read_length()?;
    if count > dec.remaining() {
        return Err(DlmsError::Decode(format!(
            "list of {} entries in {} remaining bytes",
            count,
            dec.remaining()
        )));
    }
    Ok(count)
}

/// Outcome of a GET for one attribute
///
/// Get-Data-Result CHOICE: `00 data` or `01 data-access-result`.
#[derive(Debug, Clone, PartialEq)]
pub enum GetDataResult {
    Data(DataObject),
    DataAccessResult(u8),
}

impl GetDataResult {
    pub fn encode(&self, enc: &mut AxdrEncoder) -> DlmsResult<()> {
        match self {
            GetDataResult::Data(data) => {
                enc.encode_u8(0x00);
                enc.encode_data_object(data)?;
            }
            GetDataResult::DataAccessResult(dar) => {
                enc.encode_u8(0x01);
                enc.encode_u8(*dar);
            }
        }
        Ok(())
    }

    pub fn decode(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Self> {
        match dec.read_u8()? {
            0x00 => Ok(GetDataResult::Data(dec.decode_data_object()?)),
            0x01 => Ok(GetDataResult::DataAccessResult(dec.read_u8()?)),
            other => Err(DlmsError::Decode(format!("bad get data result choice 0x{:02X}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_id_and_priority() {
        let invoke = InvokeIdAndPriority::new(8, true).unwrap();
        assert_eq!(invoke.byte(), 0x81);
        assert_eq!(invoke.invoke_id(), 8);
        assert!(invoke.is_high_priority());
        assert_eq!(InvokeIdAndPriority::new(3, false).unwrap().byte(), 0x30);
        assert!(InvokeIdAndPriority::new(16, true).is_err());
    }

    #[test]
    fn test_descriptor_layout() {
        let mut enc = AxdrEncoder::new();
        CosemItemDescriptor::new(1, ObisCode::new(0, 0, 128, 0, 0, 255), 2).encode(&mut enc);
        assert_eq!(enc.as_bytes(), &[0x00, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0xFF, 0x02]);
    }

    #[test]
    fn test_header_expect() {
        let pdu = [0xC4, 0x01, 0x81, 0x00];
        let mut dec = AxdrDecoder::new(&pdu);
        let header = PduHeader::expect(&mut dec, tag::GET_RESPONSE, 0x01).unwrap();
        assert_eq!(header.invoke.invoke_id(), 8);
        assert_eq!(dec.remaining(), 1);

        let mut dec = AxdrDecoder::new(&pdu);
        assert!(PduHeader::expect(&mut dec, tag::GET_RESPONSE, 0x02).is_err());
        assert!(PduHeader::peek(&[0xC4, 0x01]).is_err());
    }

    #[test]
    fn test_access_selection() {
        let mut enc = AxdrEncoder::new();
        let access = SelectiveAccess {
            selector: 1,
            parameters: DataObject::Unsigned(5),
        };
        encode_access_selection(&mut enc, Some(&access)).unwrap();
        encode_access_selection(&mut enc, None).unwrap();
        assert_eq!(enc.as_bytes(), &[0x01, 0x01, 0x11, 0x05, 0x00]);

        let bytes = enc.into_bytes();
        let mut dec = AxdrDecoder::new(&bytes);
        assert_eq!(decode_access_selection(&mut dec).unwrap(), Some(access));
        assert_eq!(decode_access_selection(&mut dec).unwrap(), None);
    }
}
