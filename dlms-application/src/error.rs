//! Error types shared with the lower layers

pub use dlms_core::error::*;
