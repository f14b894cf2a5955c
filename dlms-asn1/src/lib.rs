//! ASN.1 processing for the DLMS/COSEM client
//!
//! A-XDR encoding of COSEM data values, and the BER-encoded ACSE PDUs used to
//! open an application association.

pub mod axdr;
pub mod ber;
pub mod error;
pub mod iso_acse;

pub use axdr::{decode_data, encode_data, AxdrDecoder, AxdrEncoder, MAX_DEPTH};
pub use error::{DlmsError, DlmsResult};
pub use iso_acse::{decode_aare, encode_aare, encode_aarq, AareResult};
