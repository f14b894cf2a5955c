//! ACTION service PDUs
//!
//! Requests (`0xC3`): `01` normal with optional invocation parameters, `03`
//! with list. Responses (`0xC7`): `01` normal, `03` with list, each entry an
//! action result optionally followed by return parameters.

use crate::error::{DlmsError, DlmsResult};
use crate::pdu::{read_count, tag, CosemItemDescriptor, GetDataResult, InvokeIdAndPriority, PduHeader};
use crate::service::set::{decode_value_list, encode_value_list};
use dlms_asn1::{AxdrDecoder, AxdrEncoder};
use dlms_core::DataObject;

pub const REQUEST_NORMAL: u8 = 0x01;
pub const REQUEST_WITH_LIST: u8 = 0x03;

pub const RESPONSE_NORMAL: u8 = 0x01;
pub const RESPONSE_WITH_LIST: u8 = 0x03;

#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    Normal {
        invoke: InvokeIdAndPriority,
        method: CosemItemDescriptor,
        parameters: Option<DataObject>,
    },
    WithList {
        invoke: InvokeIdAndPriority,
        methods: Vec<CosemItemDescriptor>,
        parameters: Vec<DataObject>,
    },
}

impl ActionRequest {
    pub fn encode(&self) -> DlmsResult<Vec<u8>> {
        let mut enc = AxdrEncoder::new();
        match self {
            ActionRequest::Normal {
                invoke,
                method,
                parameters,
            } => {
                PduHeader::new(tag::ACTION_REQUEST, REQUEST_NORMAL, *invoke).encode(&mut enc);
                method.encode(&mut enc);
                enc.encode_optional_data(parameters.as_ref())?;
            }
            ActionRequest::WithList {
                invoke,
                methods,
                parameters,
            } => {
                if methods.len() != parameters.len() {
                    return Err(DlmsError::InvalidValue(format!(
                        "{} methods but {} parameters",
                        methods.len(),
                        parameters.len()
                    )));
                }
                PduHeader::new(tag::ACTION_REQUEST, REQUEST_WITH_LIST, *invoke).encode(&mut enc);
                enc.encode_length(methods.len());
                for method in methods {
                    method.encode(&mut enc);
                }
                encode_value_list(&mut enc, parameters)?;
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn decode(pdu: &[u8]) -> DlmsResult<Self> {
        let header = PduHeader::peek(pdu)?;
        let mut dec = AxdrDecoder::new(pdu);
        PduHeader::expect(&mut dec, tag::ACTION_REQUEST, header.choice)?;
        let invoke = header.invoke;
        match header.choice {
            REQUEST_NORMAL => {
                let method = CosemItemDescriptor::decode(&mut dec)?;
                let parameters = dec.read_optional_data()?;
                Ok(ActionRequest::Normal {
                    invoke,
                    method,
                    parameters,
                })
            }
            REQUEST_WITH_LIST => {
                let count = read_count(&mut dec)?;
                let methods = (0..count)
                    .map(|_| CosemItemDescriptor::decode(&mut dec))
                    .collect::<DlmsResult<Vec<_>>>()?;
                let parameters = decode_value_list(&mut dec)?;
                Ok(ActionRequest::WithList {
                    invoke,
                    methods,
                    parameters,
                })
            }
            other => Err(DlmsError::Decode(format!("unknown action request choice 0x{:02X}", other))),
        }
    }
}

/// Action-Response-With-Optional-Data
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub result: u8,
    pub return_parameters: Option<GetDataResult>,
}

impl ActionOutcome {
    fn encode(&self, enc: &mut AxdrEncoder) -> DlmsResult<()> {
        enc.encode_u8(self.result);
        match &self.return_parameters {
            None => enc.encode_u8(0x00),
            Some(p) => {
                enc.encode_u8(0x01);
                p.encode(enc)?;
            }
        }
        Ok(())
    }

    fn decode(dec: &mut AxdrDecoder<'_>) -> DlmsResult<Self> {
        let result = dec.read_u8()?;
        // a bare result byte is accepted as "no return parameters"
        let return_parameters = if dec.is_empty() {
            None
        } else {
            match dec.read_u8()? {
                0x00 => None,
                0x01 => Some(GetDataResult::decode(dec)?),
                other => {
                    return Err(DlmsError::Decode(format!("bad optional flag 0x{:02X}", other)));
                }
            }
        };
        Ok(Self {
            result,
            return_parameters,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionResponse {
    Normal {
        invoke: InvokeIdAndPriority,
        outcome: ActionOutcome,
    },
    WithList {
        invoke: InvokeIdAndPriority,
        outcomes: Vec<ActionOutcome>,
    },
}

impl ActionResponse {
    pub fn encode(&self) -> DlmsResult<Vec<u8>> {
        let mut enc = AxdrEncoder::new();
        match self {
            ActionResponse::Normal { invoke, outcome } => {
                PduHeader::new(tag::ACTION_RESPONSE, RESPONSE_NORMAL, *invoke).encode(&mut enc);
                outcome.encode(&mut enc)?;
            }
            ActionResponse::WithList { invoke, outcomes } => {
                PduHeader::new(tag::ACTION_RESPONSE, RESPONSE_WITH_LIST, *invoke).encode(&mut enc);
                enc.encode_length(outcomes.len());
                for outcome in outcomes {
                    outcome.encode(&mut enc)?;
                }
            }
        }
        Ok(enc.into_bytes())
    }

    pub fn decode(pdu: &[u8]) -> DlmsResult<Self> {
        let header = PduHeader::peek(pdu)?;
        let mut dec = AxdrDecoder::new(pdu);
        PduHeader::expect(&mut dec, tag::ACTION_RESPONSE, header.choice)?;
        let invoke = header.invoke;
        match header.choice {
            RESPONSE_NORMAL => Ok(ActionResponse::Normal {
                invoke,
                outcome: ActionOutcome::decode(&mut dec)?,
            }),
            RESPONSE_WITH_LIST => {
                let count = read_count(&mut dec)?;
                let outcomes = (0..count)
                    .map(|_| ActionOutcome::decode(&mut dec))
                    .collect::<DlmsResult<Vec<_>>>()?;
                Ok(ActionResponse::WithList { invoke, outcomes })
            }
            other => Err(DlmsError::Decode(format!("unknown action response choice 0x{:02X}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlms_core::ObisCode;

    fn invoke() -> InvokeIdAndPriority {
        InvokeIdAndPriority::new(1, true).unwrap()
    }

    #[test]
    fn test_action_request_normal_bytes() {
        let request = ActionRequest::Normal {
            invoke: invoke(),
            method: CosemItemDescriptor::new(70, ObisCode::new(0, 0, 96, 3, 10, 255), 1),
            parameters: Some(DataObject::Integer(0)),
        };
        let bytes = request.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0xC3, 0x01, 0x11, 0x00, 0x46, 0x00, 0x00, 0x60, 0x03, 0x0A, 0xFF, 0x01, 0x01, 0x0F, 0x00]
        );
        assert_eq!(ActionRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_action_response_normal_decode() {
        assert_eq!(
            ActionResponse::decode(&[0xC7, 0x01, 0x11, 0x00, 0x01, 0x00, 0x11, 0x05]).unwrap(),
            ActionResponse::Normal {
                invoke: invoke(),
                outcome: ActionOutcome {
                    result: 0,
                    return_parameters: Some(GetDataResult::Data(DataObject::Unsigned(5))),
                },
            }
        );
        assert_eq!(
            ActionResponse::decode(&[0xC7, 0x01, 0x11, 0x03]).unwrap(),
            ActionResponse::Normal {
                invoke: invoke(),
                outcome: ActionOutcome {
                    result: 3,
                    return_parameters: None,
                },
            }
        );
    }

    #[test]
    fn test_action_with_list_roundtrip() {
        let response = ActionResponse::WithList {
            invoke: invoke(),
            outcomes: vec![
                ActionOutcome {
                    result: 0,
                    return_parameters: None,
                },
                ActionOutcome {
                    result: 0,
                    return_parameters: Some(GetDataResult::DataAccessResult(4)),
                },
            ],
        };
        let bytes = response.encode().unwrap();
        assert_eq!(bytes, vec![0xC7, 0x03, 0x11, 0x02, 0x00, 0x00, 0x00, 0x01, 0x01, 0x04]);
        assert_eq!(ActionResponse::decode(&bytes).unwrap(), response);
    }
}
