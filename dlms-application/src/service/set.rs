//! SET service PDUs
//!
//! # Requests (`0xC1`)
//! - `01` normal, `04` with list: descriptors followed by the values
//! - `02` with first data block, `05` with list and first data block:
//!   descriptors followed by the first raw block
//! - `03` with data block: the following raw blocks
//!
//! # Responses (`0xC5`)
//! - `01` normal: one data access result
//! - `02` data block: acknowledges a block number
//! - `03` last data block: result plus block number
//! - `04` last data block with list: results plus block number
//! - `05` with list: results

use crate::error::{DlmsError, DlmsResult};
use crate::pdu::{read_count, tag, InvokeIdAndPriority, PduHeader};
use crate::service::get::{decode_attribute_list, encode_attribute_list, AttributeAccess};
use dlms_asn1::{AxdrDecoder, AxdrEncoder};
use dlms_core::DataObject;

pub const REQUEST_NORMAL: u8 = 0x01;
pub const REQUEST_WITH_FIRST_DATA_BLOCK: u8 = 0x02;
pub const REQUEST_WITH_DATA_BLOCK: u8 = 0x03;
pub const REQUEST_WITH_LIST: u8 = 0x04;
pub const REQUEST_WITH_LIST_AND_FIRST_DATA_BLOCK: u8 = 0x05;

pub const RESPONSE_NORMAL: u8 = 0x01;
pub const RESPONSE_DATA_BLOCK: u8 = 0x02;
pub const RESPONSE_LAST_DATA_BLOCK: u8 = 0x03;
pub const RESPONSE_LAST_DATA_BLOCK_WITH_LIST: u8 = 0x04;
pub const RESPONSE_WITH_LIST: u8 = 0x05;

/// One outbound raw block of a long SET
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlockSA {
    pub last_block: bool,
    pub block_number: u32,
    pub raw: Vec<u8>,
}

impl DataBlockSA {
    fn encode(&self, enc: &mut AxdrEncoder) {
        enc.encode_bool(self.last_block);
        enc.encode_u32(self.block_number);
        enc.encode_octet_string(&self.raw);
    }

    fn decode(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Self> {
        Ok(Self {
            last_block: dec.read_bool()?,
            block_number: dec.read_u32()?,
            raw: dec.read_octet_string()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetRequest {
    Normal {
        invoke: InvokeIdAndPriority,
        item: AttributeAccess,
        value: DataObject,
    },
    WithFirstDataBlock {
        invoke: InvokeIdAndPriority,
        item: AttributeAccess,
        block: DataBlockSA,
    },
    WithDataBlock {
        invoke: InvokeIdAndPriority,
        block: DataBlockSA,
    },
    WithList {
        invoke: InvokeIdAndPriority,
        items: Vec<AttributeAccess>,
        values: Vec<DataObject>,
    },
    WithListAndFirstDataBlock {
        invoke: InvokeIdAndPriority,
        items: Vec<AttributeAccess>,
        block: DataBlockSA,
    },
}

impl SetRequest {
    pub fn encode(&self) -> DlmsResult<Vec<u8>> {
        let mut enc = AxdrEncoder::new();
        match self {
            SetRequest::Normal { invoke, item, value } => {
                PduHeader::new(tag::SET_REQUEST, REQUEST_NORMAL, *invoke).encode(&mut enc);
                item.encode(&mut enc)?;
                enc.encode_data_object(value)?;
            }
            SetRequest::WithFirstDataBlock { invoke, item, block } => {
                PduHeader::new(tag::SET_REQUEST, REQUEST_WITH_FIRST_DATA_BLOCK, *invoke).encode(&mut enc);
                item.encode(&mut enc)?;
                block.encode(&mut enc);
            }
            SetRequest::WithDataBlock { invoke, block } => {
                PduHeader::new(tag::SET_REQUEST, REQUEST_WITH_DATA_BLOCK, *invoke).encode(&mut enc);
                block.encode(&mut enc);
            }
            SetRequest::WithList { invoke, items, values } => {
                if items.len() != values.len() {
                    return Err(DlmsError::InvalidValue(format!(
                        "{} descriptors but {} values",
                        items.len(),
                        values.len()
                    )));
                }
                PduHeader::new(tag::SET_REQUEST, REQUEST_WITH_LIST, *invoke).encode(&mut enc);
                encode_attribute_list(&mut enc, items)?;
                encode_value_list(&mut enc, values)?;
            }
            SetRequest::WithListAndFirstDataBlock { invoke, items, block } => {
                PduHeader::new(tag::SET_REQUEST, REQUEST_WITH_LIST_AND_FIRST_DATA_BLOCK, *invoke)
                    .encode(&mut enc);
                encode_attribute_list(&mut enc, items)?;
                block.encode(&mut enc);
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn decode(pdu: &[u8]) -> DlmsResult<Self> {
        let header = PduHeader::peek(pdu)?;
        let mut dec = AxdrDecoder::new(pdu);
        PduHeader::expect(&mut dec, tag::SET_REQUEST, header.choice)?;
        let invoke = header.invoke;
        match header.choice {
            REQUEST_NORMAL => {
                let item = AttributeAccess::decode(&mut dec)?;
                let value = dec.decode_data_object()?;
                Ok(SetRequest::Normal { invoke, item, value })
            }
            REQUEST_WITH_FIRST_DATA_BLOCK => {
                let item = AttributeAccess::decode(&mut dec)?;
                let block = DataBlockSA::decode(&mut dec)?;
                Ok(SetRequest::WithFirstDataBlock { invoke, item, block })
            }
            REQUEST_WITH_DATA_BLOCK => Ok(SetRequest::WithDataBlock {
                invoke,
                block: DataBlockSA::decode(&mut dec)?,
            }),
            REQUEST_WITH_LIST => {
                let items = decode_attribute_list(&mut dec)?;
                let values = decode_value_list(&mut dec)?;
                Ok(SetRequest::WithList { invoke, items, values })
            }
            REQUEST_WITH_LIST_AND_FIRST_DATA_BLOCK => {
                let items = decode_attribute_list(&mut dec)?;
                let block = DataBlockSA::decode(&mut dec)?;
                Ok(SetRequest::WithListAndFirstDataBlock { invoke, items, block })
            }
            other => Err(DlmsError::Decode(format!("unknown set request choice 0x{:02X}", other))),
        }
    }
}

/// Count prefixed list of values; also the raw payload of a long SET with list
pub fn encode_value_list(enc: &mut AxdrEncoder, values: &[DataObject]) -> DlmsResult<()> {
    enc.encode_length(values.len());
    for value in values {
        enc.encode_data_object(value)?;
    }
    Ok(())
}

pub fn decode_value_list(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Vec<DataObject>> {
    let count = read_count(dec)?;
    (0..count).map(|_| dec.decode_data_object()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetResponse {
    Normal {
        invoke: InvokeIdAndPriority,
        result: u8,
    },
    DataBlock {
        invoke: InvokeIdAndPriority,
        block_number: u32,
    },
    LastDataBlock {
        invoke: InvokeIdAndPriority,
        result: u8,
        block_number: u32,
    },
    LastDataBlockWithList {
        invoke: InvokeIdAndPriority,
        results: Vec<u8>,
        block_number: u32,
    },
    WithList {
        invoke: InvokeIdAndPriority,
        results: Vec<u8>,
    },
}

impl SetResponse {
    pub fn encode(&self) -> DlmsResult<Vec<u8>> {
        let mut enc = AxdrEncoder::new();
        match self {
            SetResponse::Normal { invoke, result } => {
                PduHeader::new(tag::SET_RESPONSE, RESPONSE_NORMAL, *invoke).encode(&mut enc);
                enc.encode_u8(*result);
            }
            SetResponse::DataBlock { invoke, block_number } => {
                PduHeader::new(tag::SET_RESPONSE, RESPONSE_DATA_BLOCK, *invoke).encode(&mut enc);
                enc.encode_u32(*block_number);
            }
            SetResponse::LastDataBlock {
                invoke,
                result,
                block_number,
            } => {
                PduHeader::new(tag::SET_RESPONSE, RESPONSE_LAST_DATA_BLOCK, *invoke).encode(&mut enc);
                enc.encode_u8(*result);
                enc.encode_u32(*block_number);
            }
            SetResponse::LastDataBlockWithList {
                invoke,
                results,
                block_number,
            } => {
                PduHeader::new(tag::SET_RESPONSE, RESPONSE_LAST_DATA_BLOCK_WITH_LIST, *invoke).encode(&mut enc);
                enc.encode_octet_string(results);
                enc.encode_u32(*block_number);
            }
            SetResponse::WithList { invoke, results } => {
                PduHeader::new(tag::SET_RESPONSE, RESPONSE_WITH_LIST, *invoke).encode(&mut enc);
                enc.encode_octet_string(results);
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn decode(pdu: &[u8]) -> DlmsResult<Self> {
        let header = PduHeader::peek(pdu)?;
        let mut dec = AxdrDecoder::new(pdu);
        PduHeader::expect(&mut dec, tag::SET_RESPONSE, header.choice)?;
        let invoke = header.invoke;
        match header.choice {
            RESPONSE_NORMAL => Ok(SetResponse::Normal {
                invoke,
                result: dec.read_u8()?,
            }),
            RESPONSE_DATA_BLOCK => Ok(SetResponse::DataBlock {
                invoke,
                block_number: dec.read_u32()?,
            }),
            RESPONSE_LAST_DATA_BLOCK => {
                let result = dec.read_u8()?;
                let block_number = dec.read_u32()?;
                Ok(SetResponse::LastDataBlock {
                    invoke,
                    result,
                    block_number,
                })
            }
            RESPONSE_LAST_DATA_BLOCK_WITH_LIST => {
                let results = dec.read_octet_string()?.to_vec();
                let block_number = dec.read_u32()?;
                Ok(SetResponse::LastDataBlockWithList {
                    invoke,
                    results,
                    block_number,
                })
            }
            RESPONSE_WITH_LIST => Ok(SetResponse::WithList {
                invoke,
                results: dec.read_octet_string()?.to_vec(),
            }),
            other => Err(DlmsError::Decode(format!("unknown set response choice 0x{:02X}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::CosemItemDescriptor;
    use dlms_core::ObisCode;

    fn invoke() -> InvokeIdAndPriority {
        InvokeIdAndPriority::new(2, true).unwrap()
    }

    fn clock() -> AttributeAccess {
        AttributeAccess::new(CosemItemDescriptor::new(8, ObisCode::new(0, 0, 1, 0, 0, 255), 2), None)
    }

    #[test]
    fn test_set_request_normal_bytes() {
        let request = SetRequest::Normal {
            invoke: invoke(),
            item: clock(),
            value: DataObject::LongUnsigned(0x0102),
        };
        let bytes = request.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0xC1, 0x01, 0x21, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0xFF, 0x02, 0x00, 0x12, 0x01, 0x02]
        );
        assert_eq!(SetRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_set_request_block_bytes() {
        let request = SetRequest::WithDataBlock {
            invoke: invoke(),
            block: DataBlockSA {
                last_block: true,
                block_number: 2,
                raw: vec![0xAA, 0xBB],
            },
        };
        let bytes = request.encode().unwrap();
        assert_eq!(bytes, vec![0xC1, 0x03, 0x21, 0x01, 0x00, 0x00, 0x00, 0x02, 0x02, 0xAA, 0xBB]);
        assert_eq!(SetRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_set_with_list_checks_lengths() {
        let request = SetRequest::WithList {
            invoke: invoke(),
            items: vec![clock(), clock()],
            values: vec![DataObject::Null],
        };
        assert!(request.encode().is_err());
    }

    #[test]
    fn test_set_responses() {
        assert_eq!(
            SetResponse::decode(&[0xC5, 0x02, 0x21, 0x00, 0x00, 0x00, 0x03]).unwrap(),
            SetResponse::DataBlock {
                invoke: invoke(),
                block_number: 3
            }
        );
        assert_eq!(
            SetResponse::decode(&[0xC5, 0x04, 0x21, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04]).unwrap(),
            SetResponse::LastDataBlockWithList {
                invoke: invoke(),
                results: vec![0, 3],
                block_number: 4
            }
        );
        assert!(SetResponse::decode(&[0xC5, 0x09, 0x21]).is_err());
    }
}
