//! Error types for the transport layer

pub use dlms_core::error::*;
