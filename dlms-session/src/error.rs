//! Error types for the session layer

pub use dlms_core::error::*;
