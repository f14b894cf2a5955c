//! ACSE association PDUs: AARQ encoding and AARE decoding
//!
//! The client only ever proposes a logical-name referencing context with
//! low-level (password) security, so the AARQ has a fixed shape; only the
//! calling authentication value varies.

use crate::ber::{self, BerDecoder, BerEncoder};
use crate::error::{DlmsError, DlmsResult};
use log::debug;

/// Application context name: logical name referencing, no ciphering
pub const APPLICATION_CONTEXT_LN: [u32; 7] = [2, 16, 756, 5, 8, 1, 1];

/// Mechanism name: low level security
pub const MECHANISM_LOW_LEVEL_SECURITY: [u32; 7] = [2, 16, 756, 5, 8, 2, 1];

/// sender-acse-requirements bit string: one bit (authentication) set
const ACSE_REQUIREMENTS: [u8; 2] = [0x07, 0x80];

/// xDLMS InitiateRequest: no dedicated key, no response-allowed override,
/// no quality of service, version 6, conformance 00 7E 1F, max PDU 0x04B0
pub const INITIATE_REQUEST: [u8; 14] = [
    0x01, 0x00, 0x00, 0x00, 0x06, 0x5F, 0x1F, 0x04, 0x00, 0x00, 0x7E, 0x1F, 0x04, 0xB0,
];

/// xDLMS InitiateResponse: version 6, conformance 00 10 1D, max PDU 0x04B0,
/// VAA name 0x0007
pub const INITIATE_RESPONSE: [u8; 14] = [
    0x08, 0x00, 0x06, 0x5F, 0x1F, 0x04, 0x00, 0x00, 0x10, 0x1D, 0x04, 0xB0, 0x00, 0x07,
];

const AARQ_TAG: u8 = 0x60;
const AARE_TAG: u8 = 0x61;

/// Association result values
pub mod association_result {
    pub const ACCEPTED: u8 = 0;
    pub const REJECTED_PERMANENT: u8 = 1;
    pub const REJECTED_TRANSIENT: u8 = 2;
}

/// ACSE service-user diagnostic values
pub mod diagnostic {
    pub const NULL: u8 = 0;
    pub const NO_REASON_GIVEN: u8 = 1;
    pub const APPLICATION_CONTEXT_NAME_NOT_SUPPORTED: u8 = 2;
    pub const AUTHENTICATION_MECHANISM_NAME_NOT_RECOGNISED: u8 = 11;
    pub const AUTHENTICATION_MECHANISM_NAME_REQUIRED: u8 = 12;
    pub const AUTHENTICATION_FAILURE: u8 = 13;
    pub const AUTHENTICATION_REQUIRED: u8 = 14;
}

/// Human readable text of an ACSE diagnostic code
pub fn diagnostic_text(code: u8) -> &'static str {
    match code {
        diagnostic::NULL => "null",
        diagnostic::NO_REASON_GIVEN => "no reason given",
        diagnostic::APPLICATION_CONTEXT_NAME_NOT_SUPPORTED => "application context name not supported",
        diagnostic::AUTHENTICATION_MECHANISM_NAME_NOT_RECOGNISED => "authentication mechanism name not recognised",
        diagnostic::AUTHENTICATION_MECHANISM_NAME_REQUIRED => "authentication mechanism name required",
        diagnostic::AUTHENTICATION_FAILURE => "authentication failure",
        diagnostic::AUTHENTICATION_REQUIRED => "authentication required",
        _ => "unknown diagnostic",
    }
}

/// Encode an AARQ carrying `password` as calling authentication value
pub fn encode_aarq(password: &[u8]) -> DlmsResult<Vec<u8>> {
    let mut body = BerEncoder::new();

    let mut ctx = BerEncoder::new();
    ctx.encode_object_identifier(&APPLICATION_CONTEXT_LN)?;
    body.encode_context_specific(1, &ctx.into_bytes(), true);

    body.encode_context_specific(10, &ACSE_REQUIREMENTS, false);
    body.encode_context_specific(11, &ber::encode_oid_content(&MECHANISM_LOW_LEVEL_SECURITY)?, false);

    // graphic-string choice [0] of the authentication value
    let mut auth = BerEncoder::new();
    auth.encode_context_specific(0, password, false);
    body.encode_context_specific(12, &auth.into_bytes(), true);

    let mut user_info = BerEncoder::new();
    user_info.encode_octet_string(&INITIATE_REQUEST);
    body.encode_context_specific(30, &user_info.into_bytes(), true);

    let body = body.into_bytes();
    if body.len() > 0xFF {
        return Err(DlmsError::InvalidValue(format!(
            "password of {} bytes does not fit an AARQ",
            password.len()
        )));
    }
    let mut out = BerEncoder::new();
    out.encode_tlv(AARQ_TAG, &body);
    Ok(out.into_bytes())
}

/// Decoded association response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AareResult {
    pub result: u8,
    pub diagnostic: u8,
}

impl AareResult {
    pub fn is_accepted(&self) -> bool {
        self.result == association_result::ACCEPTED
    }

    /// Turn a rejection into [`DlmsError::AssociationRejected`]
    pub fn into_result(self) -> DlmsResult<()> {
        if self.is_accepted() {
            Ok(())
        } else {
            Err(DlmsError::AssociationRejected {
                result: self.result,
                diagnostic: self.diagnostic,
            })
        }
    }
}

/// Encode the AARE a server answers an AARQ with
///
/// Only rejected associations carry a meaningful `diagnostic`.
pub fn encode_aare(result: u8, diagnostic: u8) -> DlmsResult<Vec<u8>> {
    if result > 0x7F || diagnostic > 0x7F {
        return Err(DlmsError::InvalidValue(format!(
            "AARE result {} / diagnostic {} out of range",
            result, diagnostic
        )));
    }
    let mut body = BerEncoder::new();

    let mut ctx = BerEncoder::new();
    ctx.encode_object_identifier(&APPLICATION_CONTEXT_LN)?;
    body.encode_context_specific(1, &ctx.into_bytes(), true);

    let mut res = BerEncoder::new();
    res.encode_tlv(0x02, &[result]);
    body.encode_context_specific(2, &res.into_bytes(), true);

    // service-user diagnostic
    let mut diag = BerEncoder::new();
    diag.encode_tlv(0x02, &[diagnostic]);
    let mut source = BerEncoder::new();
    source.encode_context_specific(1, &diag.into_bytes(), true);
    body.encode_context_specific(3, &source.into_bytes(), true);

    let mut user_info = BerEncoder::new();
    user_info.encode_octet_string(&INITIATE_RESPONSE);
    body.encode_context_specific(30, &user_info.into_bytes(), true);

    let mut out = BerEncoder::new();
    out.encode_tlv(AARE_TAG, &body.into_bytes());
    Ok(out.into_bytes())
}

/// Decode an AARE, extracting the association result and diagnostic
pub fn decode_aare(pdu: &[u8]) -> DlmsResult<AareResult> {
    let mut outer = BerDecoder::new(pdu);
    let (tag, body) = outer.decode_tlv()?;
    if tag != AARE_TAG {
        return Err(DlmsError::Decode(format!("expected AARE tag 0x61, got 0x{:02X}", tag)));
    }

    let mut result = None;
    let mut diag = diagnostic::NULL;
    let mut dec = BerDecoder::new(body);
    while dec.has_remaining() {
        let (tag, value) = dec.decode_tlv()?;
        match tag {
            // [2] result
            0xA2 => result = Some(BerDecoder::new(value).decode_integer()? as u8),
            // [3] result-source-diagnostic: [1] service-user or [2] service-provider
            0xA3 => {
                let (_, inner) = BerDecoder::new(value).decode_tlv()?;
                diag = BerDecoder::new(inner).decode_integer()? as u8;
            }
            _ => debug!("AARE: skipping element 0x{:02X} ({} bytes)", tag, value.len()),
        }
    }

    let result = result.ok_or_else(|| DlmsError::Decode("AARE without result".to_string()))?;
    Ok(AareResult {
        result,
        diagnostic: diag,
    })
}
