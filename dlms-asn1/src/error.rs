//! Error types for ASN.1 processing

pub use dlms_core::error::*;
