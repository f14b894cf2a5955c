//! GET service PDUs
//!
//! # Requests (`0xC0`)
//! - `01` normal: one attribute descriptor with optional access selection
//! - `02` next data block: the number of the last block received
//! - `03` with list: count prefixed descriptors
//!
//! # Responses (`0xC4`)
//! - `01` normal: one [`GetDataResult`]
//! - `02` with data block: `last-block`, `block-number`, then `00` + raw octet
//!   string or `01` + data access result
//! - `03` with list: count prefixed [`GetDataResult`]s
//!
//! Long values travel as raw blocks. Once reassembled the raw bytes are the
//! encoded value itself (normal) or a count prefixed list of results (with list).

use crate::error::{DlmsError, DlmsResult};
use crate::pdu::{
    decode_access_selection, encode_access_selection, read_count, tag, CosemItemDescriptor,
    GetDataResult, InvokeIdAndPriority, PduHeader, SelectiveAccess,
};
use dlms_asn1::{AxdrDecoder, AxdrEncoder, MAX_DEPTH};
use dlms_core::DataObject;

pub const REQUEST_NORMAL: u8 = 0x01;
pub const REQUEST_NEXT: u8 = 0x02;
pub const REQUEST_WITH_LIST: u8 = 0x03;

pub const RESPONSE_NORMAL: u8 = 0x01;
pub const RESPONSE_WITH_DATA_BLOCK: u8 = 0x02;
pub const RESPONSE_WITH_LIST: u8 = 0x03;

/// Attribute descriptor plus optional selective access
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeAccess {
    pub descriptor: CosemItemDescriptor,
    pub access: Option<SelectiveAccess>,
}

impl AttributeAccess {
    pub fn new(descriptor: CosemItemDescriptor, access: Option<SelectiveAccess>) -> Self {
        Self { descriptor, access }
    }

    pub fn encode(&self, enc: &mut AxdrEncoder) -> DlmsResult<()> {
        self.descriptor.encode(enc);
        encode_access_selection(enc, self.access.as_ref())
    }

    pub fn decode(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Self> {
        let descriptor = CosemItemDescriptor::decode(dec)?;
        let access = decode_access_selection(dec)?;
        Ok(Self { descriptor, access })
    }
}

/// Encode a count prefixed list of attribute references
pub(crate) fn encode_attribute_list(enc: &mut AxdrEncoder, items: &[AttributeAccess]) -> DlmsResult<()> {
    enc.encode_length(items.len());
    for item in items {
        item.encode(enc)?;
    }
    Ok(())
}

pub(crate) fn decode_attribute_list(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Vec<AttributeAccess>> {
    let count = read_count(dec)?;
    (0..count).map(|_| AttributeAccess::decode(dec)).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum GetRequest {
    Normal {
        invoke: InvokeIdAndPriority,
        item: AttributeAccess,
    },
    Next {
        invoke: InvokeIdAndPriority,
        block_number: u32,
    },
    WithList {
        invoke: InvokeIdAndPriority,
        items: Vec<AttributeAccess>,
    },
}

impl GetRequest {
    pub fn invoke(&self) -> InvokeIdAndPriority {
        match self {
            GetRequest::Normal { invoke, .. }
            | GetRequest::Next { invoke, .. }
            | GetRequest::WithList { invoke, .. } => *invoke,
        }
    }

    pub fn encode(&self) -> DlmsResult<Vec<u8>> {
        let mut enc = AxdrEncoder::new();
        match self {
            GetRequest::Normal { invoke, item } => {
                PduHeader::new(tag::GET_REQUEST, REQUEST_NORMAL, *invoke).encode(&mut enc);
                item.encode(&mut enc)?;
            }
            GetRequest::Next { invoke, block_number } => {
                PduHeader::new(tag::GET_REQUEST, REQUEST_NEXT, *invoke).encode(&mut enc);
                enc.encode_u32(*block_number);
            }
            GetRequest::WithList { invoke, items } => {
                PduHeader::new(tag::GET_REQUEST, REQUEST_WITH_LIST, *invoke).encode(&mut enc);
                encode_attribute_list(&mut enc, items)?;
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn decode(pdu: &[u8]) -> DlmsResult<Self> {
        let header = PduHeader::peek(pdu)?;
        let mut dec = AxdrDecoder::new(pdu);
        PduHeader::expect(&mut dec, tag::GET_REQUEST, header.choice)?;
        let invoke = header.invoke;
        match header.choice {
            REQUEST_NORMAL => Ok(GetRequest::Normal {
                invoke,
                item: AttributeAccess::decode(&mut dec)?,
            }),
            REQUEST_NEXT => Ok(GetRequest::Next {
                invoke,
                block_number: dec.read_u32()?,
            }),
            REQUEST_WITH_LIST => Ok(GetRequest::WithList {
                invoke,
                items: decode_attribute_list(&mut dec)?,
            }),
            other => Err(DlmsError::Decode(format!("unknown get request choice 0x{:02X}", other))),
        }
    }
}

/// Payload of one GET data block
#[derive(Debug, Clone, PartialEq)]
pub enum BlockResult {
    RawData(Vec<u8>),
    DataAccessResult(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataBlockG {
    pub last_block: bool,
    pub block_number: u32,
    pub result: BlockResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GetResponse {
    Normal {
        invoke: InvokeIdAndPriority,
        result: GetDataResult,
    },
    WithDataBlock {
        invoke: InvokeIdAndPriority,
        block: DataBlockG,
    },
    WithList {
        invoke: InvokeIdAndPriority,
        results: Vec<GetDataResult>,
    },
}

impl GetResponse {
    pub fn encode(&self) -> DlmsResult<Vec<u8>> {
        let mut enc = AxdrEncoder::new();
        match self {
            GetResponse::Normal { invoke, result } => {
                PduHeader::new(tag::GET_RESPONSE, RESPONSE_NORMAL, *invoke).encode(&mut enc);
                result.encode(&mut enc)?;
            }
            GetResponse::WithDataBlock { invoke, block } => {
                PduHeader::new(tag::GET_RESPONSE, RESPONSE_WITH_DATA_BLOCK, *invoke).encode(&mut enc);
                enc.encode_bool(block.last_block);
                enc.encode_u32(block.block_number);
                match &block.result {
                    BlockResult::RawData(raw) => {
                        enc.encode_u8(0x00);
                        enc.encode_octet_string(raw);
                    }
                    BlockResult::DataAccessResult(dar) => {
                        enc.encode_u8(0x01);
                        enc.encode_u8(*dar);
                    }
                }
            }
            GetResponse::WithList { invoke, results } => {
                PduHeader::new(tag::GET_RESPONSE, RESPONSE_WITH_LIST, *invoke).encode(&mut enc);
                encode_result_list(&mut enc, results)?;
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn decode(pdu: &[u8]) -> DlmsResult<Self> {
        let header = PduHeader::peek(pdu)?;
        let mut dec = AxdrDecoder::new(pdu);
        PduHeader::expect(&mut dec, tag::GET_RESPONSE, header.choice)?;
        let invoke = header.invoke;
        match header.choice {
            RESPONSE_NORMAL => Ok(GetResponse::Normal {
                invoke,
                result: GetDataResult::decode(&mut dec)?,
            }),
            RESPONSE_WITH_DATA_BLOCK => {
                let last_block = dec.read_bool()?;
                let block_number = dec.read_u32()?;
                let result = match dec.read_u8()? {
                    0x00 => BlockResult::RawData(dec.read_octet_string()?.to_vec()),
                    0x01 => BlockResult::DataAccessResult(dec.read_u8()?),
                    other => {
                        return Err(DlmsError::Decode(format!("bad data block choice 0x{:02X}", other)));
                    }
                };
                Ok(GetResponse::WithDataBlock {
                    invoke,
                    block: DataBlockG {
                        last_block,
                        block_number,
                        result,
                    },
                })
            }
            RESPONSE_WITH_LIST => Ok(GetResponse::WithList {
                invoke,
                results: decode_result_list(&mut dec)?,
            }),
            other => Err(DlmsError::Decode(format!("unknown get response choice 0x{:02X}", other))),
        }
    }
}

pub fn encode_result_list(enc: &mut AxdrEncoder, results: &[GetDataResult]) -> DlmsResult<()> {
    enc.encode_length(results.len());
    for result in results {
        result.encode(enc)?;
    }
    Ok(())
}

pub fn decode_result_list(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Vec<GetDataResult>> {
    let count = read_count(dec)?;
    (0..count).map(|_| GetDataResult::decode(dec)).collect()
}

/// Decode the reassembled blocks of a normal GET: the encoded value
pub fn decode_block_value(raw: &[u8]) -> DlmsResult<DataObject> {
    AxdrDecoder::new(raw).decode_data_object()
}

/// Decode the reassembled blocks of a GET with list
pub fn decode_block_results(raw: &[u8]) -> DlmsResult<Vec<GetDataResult>> {
    decode_result_list(&mut AxdrDecoder::new(raw))
}

/// Best-effort decoding of a value cut short
///
/// Arrays and structures keep the elements that were received completely.
/// Returns `None` when not even the outermost value can be recovered.
/// Nesting stops at the same depth as full decoding.
pub fn decode_partial_value(raw: &[u8]) -> Option<DataObject> {
    partial_value(&mut AxdrDecoder::new(raw), 0)
}

fn partial_value(dec: &mut AxdrDecoder<'_>, depth: usize) -> Option<DataObject> {
    let tag = *dec.rest().first()?;
    if tag != dlms_core::datatypes::tag::ARRAY && tag != dlms_core::datatypes::tag::STRUCTURE {
        return dec.decode_data_object().ok();
    }
    if depth >= MAX_DEPTH {
        return None;
    }
    dec.read_u8().ok()?;
    let count = dec.read_length().ok()?;
    let mut items = Vec::new();
    while items.len() < count {
        match partial_value(dec, depth + 1) {
            Some(item) => items.push(item),
            None => break,
        }
    }
    if tag == dlms_core::datatypes::tag::ARRAY {
        Some(DataObject::Array(items))
    } else {
        Some(DataObject::Structure(items))
    }
}

/// Best-effort decoding of a result list cut short
///
/// Keeps every entry that could be recovered, the last one possibly holding a
/// partial value.
pub fn decode_partial_results(raw: &[u8]) -> Vec<GetDataResult> {
    let mut dec = AxdrDecoder::new(raw);
    let Ok(count) = dec.read_length() else {
        return Vec::new();
    };
    let mut results = Vec::new();
    while results.len() < count {
        let result = match dec.read_u8() {
            Ok(0x00) => partial_value(&mut dec, 0).map(GetDataResult::Data),
            Ok(0x01) => dec.read_u8().ok().map(GetDataResult::DataAccessResult),
            _ => None,
        };
        match result {
            Some(result) => results.push(result),
            None => break,
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlms_core::ObisCode;

    fn item(obis: ObisCode) -> AttributeAccess {
        AttributeAccess::new(CosemItemDescriptor::new(1, obis, 2), None)
    }

    fn invoke() -> InvokeIdAndPriority {
        InvokeIdAndPriority::new(8, true).unwrap()
    }

    #[test]
    fn test_get_request_normal_bytes() {
        let request = GetRequest::Normal {
            invoke: invoke(),
            item: item(ObisCode::new(0, 0, 128, 0, 0, 255)),
        };
        let bytes = request.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0xC0, 0x01, 0x81, 0x00, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0xFF, 0x02, 0x00]
        );
        assert_eq!(GetRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_get_request_with_list_bytes() {
        let request = GetRequest::WithList {
            invoke: invoke(),
            items: vec![
                item(ObisCode::new(0, 0, 128, 0, 0, 255)),
                item(ObisCode::new(0, 0, 128, 1, 0, 255)),
            ],
        };
        assert_eq!(
            request.encode().unwrap(),
            vec![
                0xC0, 0x03, 0x81, 0x02, 0x00, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0xFF, 0x02, 0x00,
                0x00, 0x01, 0x00, 0x00, 0x80, 0x01, 0x00, 0xFF, 0x02, 0x00
            ]
        );
    }

    #[test]
    fn test_get_request_next_bytes() {
        let request = GetRequest::Next {
            invoke: invoke(),
            block_number: 1,
        };
        assert_eq!(request.encode().unwrap(), vec![0xC0, 0x02, 0x81, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_get_response_normal_decode() {
        let pdu = [0xC4, 0x01, 0x81, 0x00, 0x09, 0x06, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        match GetResponse::decode(&pdu).unwrap() {
            GetResponse::Normal { invoke, result } => {
                assert_eq!(invoke.byte(), 0x81);
                assert_eq!(
                    result,
                    GetDataResult::Data(DataObject::OctetString(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]))
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_response_data_block_decode() {
        let mut pdu = vec![0xC4, 0x02, 0x81, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x1E];
        pdu.extend((0..30u8).collect::<Vec<_>>());
        match GetResponse::decode(&pdu).unwrap() {
            GetResponse::WithDataBlock { block, .. } => {
                assert!(!block.last_block);
                assert_eq!(block.block_number, 1);
                assert_eq!(block.result, BlockResult::RawData((0..30u8).collect()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_response_failure_result() {
        let pdu = [0xC4, 0x01, 0x81, 0x01, 0x04];
        assert_eq!(
            GetResponse::decode(&pdu).unwrap(),
            GetResponse::Normal {
                invoke: invoke(),
                result: GetDataResult::DataAccessResult(4),
            }
        );
    }

    #[test]
    fn test_partial_value_keeps_complete_elements() {
        // array of three octet strings, the last one cut short
        let raw = [0x01, 0x03, 0x09, 0x02, 0x01, 0x02, 0x09, 0x01, 0x03, 0x09, 0x04, 0x01];
        assert_eq!(
            decode_partial_value(&raw),
            Some(DataObject::Array(vec![
                DataObject::OctetString(vec![1, 2]),
                DataObject::OctetString(vec![3]),
            ]))
        );
        assert_eq!(decode_partial_value(&[0x09, 0x04, 0x01]), None);
        assert!(decode_block_value(&raw).is_err());
    }

    #[test]
    fn test_partial_value_nesting_is_bounded() {
        let raw = [0x01, 0x01].repeat(500_000);
        let mut value = decode_partial_value(&raw).unwrap();
        let mut levels = 1;
        while let DataObject::Array(mut items) = value {
            match items.pop() {
                Some(inner) => {
                    assert!(items.is_empty());
                    value = inner;
                    levels += 1;
                }
                None => break,
            }
        }
        assert_eq!(levels, MAX_DEPTH);
        assert!(decode_block_value(&raw).is_err());
    }

    #[test]
    fn test_partial_block_results() {
        // two results announced, the second one cut short
        let raw = [0x02, 0x00, 0x11, 0x07, 0x00, 0x09, 0x04, 0x01];
        assert_eq!(
            decode_partial_results(&raw),
            vec![GetDataResult::Data(DataObject::Unsigned(7))]
        );
        assert!(decode_block_results(&raw).is_err());

        let raw = [0x01, 0x01, 0x03];
        assert_eq!(decode_block_results(&raw).unwrap(), vec![GetDataResult::DataAccessResult(3)]);
    }
}
